//! WriteFile tool - create or overwrite a file. Edit mode only.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ToolError;
use crate::state::Mode;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};
use crate::tools::safeguard;

pub struct WriteFileTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write full file content, creating the file or overwriting what is there. Parent directories are created as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The absolute path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    fn is_mutating(&self, _input: &Value) -> bool {
        true
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.mode != Mode::Edit {
            return Err(ToolError::PermissionDenied(
                "write_file is only available in edit mode".to_string(),
            ));
        }
        let params: Params = parse_params(input.clone())?;
        let path = ctx.resolve_path(&params.file_path);
        safeguard::authorize_path(ctx, &path).await?;
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let path = ctx.resolve_path(&params.file_path);

        if let Some(parent) = path.parent().filter(|p| !p.exists()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &params.content).await?;

        Ok(json!({
            "file_path": path.display().to_string(),
            "content": params.content,
            "bytes_written": params.content.len(),
        }))
    }

    async fn post_hook(&self, raw: Value, ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let path = ctx.resolve_path(raw["file_path"].as_str().unwrap_or(""));
        let content = raw["content"].as_str().unwrap_or("");
        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        ctx.state.file_cache.mark_modified(&path, content, mtime);

        let bytes = raw["bytes_written"].as_u64().unwrap_or(0);
        let data = json!({
            "file_path": raw["file_path"],
            "bytes_written": bytes,
            "lines": content.lines().count(),
        });
        Ok(ToolResponse::new(
            data,
            format!("wrote {} bytes to {}", bytes, path.display()),
        ))
    }
}
