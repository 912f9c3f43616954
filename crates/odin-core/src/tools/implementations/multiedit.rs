//! MultiEdit tool - atomic ordered batch of edits against one file.
//!
//! Edits apply sequentially to an in-memory buffer; if any edit misses its
//! target nothing is written, so on-disk content is untouched on failure.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::cache::sufficiency;
use crate::error::ToolError;
use crate::state::Mode;
use crate::tools::implementations::unified_edit_diff;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};
use crate::tools::safeguard;

pub struct MultiEditTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    edits: Vec<EditOp>,
}

#[derive(Deserialize)]
struct EditOp {
    old_string: String,
    new_string: String,
}

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "multiedit"
    }

    fn description(&self) -> &str {
        "Apply an ordered batch of string replacements to one file atomically. If any edit fails to find its target, the file is left untouched. Cannot create files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The absolute path of the file to edit"
                },
                "edits": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" }
                        },
                        "required": ["old_string", "new_string"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["file_path", "edits"],
            "additionalProperties": false
        })
    }

    fn is_mutating(&self, _input: &Value) -> bool {
        true
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.mode != Mode::Edit {
            return Err(ToolError::PermissionDenied(
                "multiedit is only available in edit mode".to_string(),
            ));
        }
        let params: Params = parse_params(input.clone())?;
        if params.edits.is_empty() {
            return Err(ToolError::Validation("at least one edit is required".to_string()));
        }
        for (i, edit) in params.edits.iter().enumerate() {
            if edit.old_string.is_empty() {
                return Err(ToolError::Validation(format!(
                    "edit {}: old_string must not be empty",
                    i + 1
                )));
            }
            if edit.old_string == edit.new_string {
                return Err(ToolError::Validation(format!(
                    "edit {}: new_string must differ from old_string",
                    i + 1
                )));
            }
        }

        let path = ctx.resolve_path(&params.file_path);
        safeguard::authorize_path(ctx, &path).await?;

        // Sufficiency over the union of targets: every old_string must be
        // covered by the cached content.
        for edit in &params.edits {
            sufficiency::check_sufficiency(
                &ctx.state.file_cache,
                ctx.services.validator.as_ref(),
                &path,
                &edit.old_string,
                &edit.new_string,
            )
            .await?;
        }

        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let path = ctx.resolve_path(&params.file_path);

        if !path.exists() {
            return Err(ToolError::TargetNotFound(format!(
                "multiedit cannot create files: {}",
                path.display()
            )));
        }

        let original = fs::read_to_string(&path).await?;
        ctx.state.file_cache.verify_disk(&path, &original)?;

        let mut buffer = original.clone();
        for (i, edit) in params.edits.iter().enumerate() {
            let occurrences = buffer.matches(&edit.old_string).count();
            match occurrences {
                0 => {
                    return Err(ToolError::TargetNotFound(format!(
                        "edit {}: old_string not found; no edits applied",
                        i + 1
                    )))
                }
                1 => buffer = buffer.replacen(&edit.old_string, &edit.new_string, 1),
                n => {
                    return Err(ToolError::Validation(format!(
                        "edit {}: old_string occurs {} times; no edits applied",
                        i + 1,
                        n
                    )))
                }
            }
        }

        fs::write(&path, &buffer).await?;

        Ok(json!({
            "file_path": path.display().to_string(),
            "old_content": original,
            "new_content": buffer,
            "edits_applied": params.edits.len(),
        }))
    }

    async fn post_hook(&self, raw: Value, ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let path = ctx.resolve_path(raw["file_path"].as_str().unwrap_or(""));
        let old_content = raw["old_content"].as_str().unwrap_or("");
        let new_content = raw["new_content"].as_str().unwrap_or("");
        let applied = raw["edits_applied"].as_u64().unwrap_or(0);

        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        ctx.state.file_cache.mark_modified(&path, new_content, mtime);

        let diff = unified_edit_diff(&path, old_content, new_content);
        let data = json!({
            "file_path": raw["file_path"],
            "edits_applied": applied,
            "diff": diff,
        });
        Ok(ToolResponse::new(
            data,
            format!("applied {} edits to {}", applied, path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, ScriptedPlanner};

    async fn run_multiedit(ctx: &ToolContext, input: Value) -> Result<ToolResponse, ToolError> {
        let tool = MultiEditTool;
        let phr = tool.pre_hook(input, ctx).await?;
        let raw = tool.execute(phr, ctx).await?;
        tool.post_hook(raw, ctx).await
    }

    #[tokio::test]
    async fn applies_edits_in_order() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("chain.rs");
        let content = "fn alpha() {}\nfn beta() {}\n";
        std::fs::write(&path, content).unwrap();
        ctx.state.file_cache.put_full(&path, content, None);

        let response = run_multiedit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "edits": [
                    {"old_string": "alpha", "new_string": "first"},
                    {"old_string": "beta", "new_string": "second"}
                ]
            }),
        )
        .await
        .unwrap();

        assert!(response.description.contains("2 edits"));
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("first") && on_disk.contains("second"));

        let view = ctx.state.file_cache.get(&path).unwrap();
        assert!(view.is_modified);
    }

    #[tokio::test]
    async fn later_edit_can_target_earlier_result() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("seq.rs");
        let content = "let value = 1;\n";
        std::fs::write(&path, content).unwrap();
        ctx.state.file_cache.put_full(&path, content, None);

        // The second edit only matches after the first has run; the
        // sufficiency validator approves anything found in cached content,
        // so bypass pre_hook subtleties by checking execute semantics.
        let tool = MultiEditTool;
        let raw = tool
            .execute(
                json!({
                    "file_path": path.display().to_string(),
                    "edits": [
                        {"old_string": "value = 1", "new_string": "value = 2"},
                        {"old_string": "value = 2", "new_string": "value = 3"}
                    ]
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(raw["new_content"], "let value = 3;\n");
    }

    #[tokio::test]
    async fn failed_edit_leaves_disk_byte_identical() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("atomic.rs");
        let content = "fn solid() {}\nfn ground() {}\n";
        std::fs::write(&path, content).unwrap();
        ctx.state.file_cache.put_full(&path, content, None);

        let tool = MultiEditTool;
        let err = tool
            .execute(
                json!({
                    "file_path": path.display().to_string(),
                    "edits": [
                        {"old_string": "solid", "new_string": "liquid"},
                        {"old_string": "does_not_exist", "new_string": "x"}
                    ]
                }),
                &ctx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::TargetNotFound(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn cannot_create_files() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("ghost.rs");
        // Cache carries an entry even though the file is gone from disk.
        ctx.state.file_cache.put_full(&path, "phantom", None);

        let tool = MultiEditTool;
        let err = tool
            .execute(
                json!({
                    "file_path": path.display().to_string(),
                    "edits": [{"old_string": "phantom", "new_string": "real"}]
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn empty_edit_list_rejected() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = MultiEditTool;
        let err = tool
            .pre_hook(json!({"file_path": "/ws/a.rs", "edits": []}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
