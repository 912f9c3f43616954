//! Glob tool - pattern matching over the workspace, newest first.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

pub struct GlobTool;

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files by glob pattern (e.g. **/*.rs). Results are sorted by modification time, newest first, and flag files already cached."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match against file paths"
                },
                "path": {
                    "type": "string",
                    "description": "Base directory to search (default: workspace root)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let base = match &params.path {
            Some(p) => ctx.resolve_path(p),
            None => ctx.state.workspace_root.clone(),
        };

        let full_pattern = format!("{}/{}", base.display(), params.pattern);
        let paths = glob::glob(&full_pattern)
            .map_err(|e| ToolError::Validation(format!("bad glob pattern: {}", e)))?;

        let mut matches: Vec<(std::path::PathBuf, SystemTime)> = Vec::new();
        for entry in paths.flatten() {
            if !entry.is_file() {
                continue;
            }
            let mtime = std::fs::metadata(&entry)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            matches.push((entry, mtime));
        }
        matches.sort_by(|a, b| b.1.cmp(&a.1));

        let files: Vec<Value> = matches
            .iter()
            .map(|(path, _)| {
                json!({
                    "path": path.display().to_string(),
                    "already_cached": ctx.state.file_cache.contains(path),
                })
            })
            .collect();

        Ok(json!({
            "pattern": params.pattern,
            "files": files,
            "total": files.len(),
        }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let total = raw["total"].as_u64().unwrap_or(0);
        let pattern = raw["pattern"].as_str().unwrap_or("").to_string();
        Ok(ToolResponse::new(
            raw,
            format!("glob '{}' matched {} files", pattern, total),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, ScriptedPlanner};

    #[tokio::test]
    async fn matches_sort_newest_first() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        std::fs::write(dir.path().join("old.rs"), "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(dir.path().join("new.rs"), "b").unwrap();

        let tool = GlobTool;
        let raw = tool.execute(json!({"pattern": "*.rs"}), &ctx).await.unwrap();

        let files = raw["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0]["path"].as_str().unwrap().ends_with("new.rs"));
    }

    #[tokio::test]
    async fn annotates_cached_files() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        let file = dir.path().join("lib.rs");
        std::fs::write(&file, "pub fn x() {}").unwrap();
        ctx.state.file_cache.put_full(&file, "pub fn x() {}", None);

        let tool = GlobTool;
        let raw = tool.execute(json!({"pattern": "*.rs"}), &ctx).await.unwrap();
        assert_eq!(raw["files"][0]["already_cached"], true);
    }
}
