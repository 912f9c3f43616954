//! Edit tool - exact-string replacement gated by the cache sufficiency check.

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

pub struct EditTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace old_string with new_string in a file. The file must be cached with enough context first; old_string must match exactly once unless replace_all is set."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The absolute path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text; must differ from old_string"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)",
                    "default": false
                }
            },
            "required": ["file_path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn is_mutating(&self, _input: &Value) -> bool {
        true
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.mode != Mode::Edit {
            return Err(ToolError::PermissionDenied(
                "edit is only available in edit mode".to_string(),
            ));
        }
        let params: Params = parse_params(input.clone())?;
        if params.new_string == params.old_string {
            return Err(ToolError::Validation(
                "new_string must differ from old_string".to_string(),
            ));
        }
        if params.old_string.is_empty() {
            return Err(ToolError::Validation("old_string must not be empty".to_string()));
        }

        let path = ctx.resolve_path(&params.file_path);
        safeguard::authorize_path(ctx, &path).await?;

        // Read-before-write: the cache must hold the target with enough
        // context, as judged by the sufficiency validator.
        sufficiency::check_sufficiency(
            &ctx.state.file_cache,
            ctx.services.validator.as_ref(),
            &path,
            &params.old_string,
            &params.new_string,
        )
        .await?;

        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let path = ctx.resolve_path(&params.file_path);

        let content = fs::read_to_string(&path).await.map_err(|e| {
            ToolError::TargetNotFound(format!("cannot read {}: {}", path.display(), e))
        })?;

        // External edits since caching invalidate the entry and fail the call.
        ctx.state.file_cache.verify_disk(&path, &content)?;

        let occurrences = content.matches(&params.old_string).count();
        let (new_content, replacements) = if params.replace_all {
            if occurrences == 0 {
                return Err(ToolError::TargetNotFound(format!(
                    "old_string not found in {}",
                    path.display()
                )));
            }
            (
                content.replace(&params.old_string, &params.new_string),
                occurrences,
            )
        } else {
            match occurrences {
                0 => {
                    return Err(ToolError::TargetNotFound(format!(
                        "old_string not found in {}",
                        path.display()
                    )))
                }
                1 => (
                    content.replacen(&params.old_string, &params.new_string, 1),
                    1,
                ),
                n => {
                    return Err(ToolError::Validation(format!(
                        "old_string occurs {} times; provide more context or set replace_all",
                        n
                    )))
                }
            }
        };

        fs::write(&path, &new_content).await?;

        Ok(json!({
            "file_path": path.display().to_string(),
            "old_content": content,
            "new_content": new_content,
            "replacements": replacements,
        }))
    }

    async fn post_hook(&self, raw: Value, ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let path = ctx.resolve_path(raw["file_path"].as_str().unwrap_or(""));
        let old_content = raw["old_content"].as_str().unwrap_or("");
        let new_content = raw["new_content"].as_str().unwrap_or("");
        let replacements = raw["replacements"].as_u64().unwrap_or(0);

        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        ctx.state.file_cache.mark_modified(&path, new_content, mtime);

        let diff = unified_edit_diff(&path, old_content, new_content);
        let data = json!({
            "file_path": raw["file_path"],
            "replacements": replacements,
            "diff": diff,
        });
        Ok(ToolResponse::new(
            data,
            format!(
                "replaced {} occurrence(s) in {}",
                replacements,
                path.display()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::content_hash;
    use crate::test_support::{test_context, ScriptedPlanner};

    async fn run_edit(ctx: &ToolContext, input: Value) -> Result<ToolResponse, ToolError> {
        let tool = EditTool;
        let phr = tool.pre_hook(input, ctx).await?;
        let raw = tool.execute(phr, ctx).await?;
        tool.post_hook(raw, ctx).await
    }

    #[tokio::test]
    async fn cached_file_edits_and_marks_modified() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("auth.go");
        let content = "func auth() {\n    // TODO check token\n}\n";
        std::fs::write(&path, content).unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        ctx.state.file_cache.put_full(&path, content, Some(mtime));

        let response = run_edit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "old_string": "TODO",
                "new_string": "FIXME"
            }),
        )
        .await
        .unwrap();

        assert!(response.description.contains("1 occurrence"));
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("FIXME"));

        let view = ctx.state.file_cache.get(&path).expect("cached");
        assert!(view.is_modified);
        assert_eq!(view.content_hash, Some(content_hash(&on_disk)));
    }

    #[tokio::test]
    async fn uncached_file_is_rejected_before_execute() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("foo.go");
        std::fs::write(&path, "X marks the spot").unwrap();

        let err = run_edit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "old_string": "X",
                "new_string": "Y"
            }),
        )
        .await
        .unwrap_err();

        match err {
            ToolError::CacheInsufficient { explanation, .. } => {
                assert_eq!(explanation, "must read file first");
            }
            other => panic!("expected CacheInsufficient, got {:?}", other),
        }
        // Pre-hook failure leaves the file untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "X marks the spot");
    }

    #[tokio::test]
    async fn identical_strings_rejected() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let err = run_edit(
            &ctx,
            json!({"file_path": "/ws/a.rs", "old_string": "same", "new_string": "same"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn ambiguous_match_requires_replace_all() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("dup.rs");
        let content = "let x = 1;\nlet x = 1;\n";
        std::fs::write(&path, content).unwrap();
        ctx.state.file_cache.put_full(&path, content, None);

        let err = run_edit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "old_string": "let x = 1;",
                "new_string": "let y = 2;"
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let response = run_edit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "old_string": "let x = 1;",
                "new_string": "let y = 2;",
                "replace_all": true
            }),
        )
        .await
        .unwrap();
        assert!(response.description.contains("2 occurrence"));
    }

    #[tokio::test]
    async fn external_modification_detected_and_entry_invalidated() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let path = dir.path().join("race.rs");
        let cached = "original content with TODO";
        std::fs::write(&path, cached).unwrap();
        ctx.state.file_cache.put_full(&path, cached, None);

        // Someone else rewrites the file; mtime checking is off in the test
        // config, so the hash check has to catch it.
        std::fs::write(&path, "tampered content with TODO").unwrap();

        let err = run_edit(
            &ctx,
            json!({
                "file_path": path.display().to_string(),
                "old_string": "TODO",
                "new_string": "FIXME"
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ToolError::ExternalModification(_)));
        assert!(!ctx.state.file_cache.contains(&path));
    }
}
