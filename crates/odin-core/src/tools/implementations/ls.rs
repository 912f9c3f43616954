//! LS tool - list a directory, flagging files already in the cache.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ToolError;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

/// Directories that never show up in listings.
const BUILTIN_IGNORES: &[&str] = &[".git", "node_modules", "target"];

pub struct LsTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    ignore: Vec<String>,
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List entries of an absolute directory. Supports glob ignore patterns and marks files that are already cached."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The absolute path of the directory to list"
                },
                "ignore": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns to exclude"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn pre_hook(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input.clone())?;
        if !std::path::Path::new(&params.path).is_absolute() {
            return Err(ToolError::Validation(format!(
                "path must be absolute, got '{}'",
                params.path
            )));
        }
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let dir = ctx.resolve_path(&params.path);

        if !dir.is_dir() {
            return Err(ToolError::Validation(format!(
                "not a directory: {}",
                dir.display()
            )));
        }

        let ignore_patterns: Vec<glob::Pattern> = params
            .ignore
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if BUILTIN_IGNORES.contains(&name.as_str()) {
                continue;
            }
            if ignore_patterns.iter().any(|p| p.matches(&name)) {
                continue;
            }

            let is_dir = entry
                .file_type()
                .await
                .map(|ft| ft.is_dir())
                .unwrap_or(false);
            let cached = !is_dir && ctx.state.file_cache.contains(&entry.path());
            entries.push((name, is_dir, cached));
        }

        // Directories first, then case-insensitive by name.
        entries.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
        });

        let listing: Vec<Value> = entries
            .iter()
            .map(|(name, is_dir, cached)| {
                json!({
                    "name": if *is_dir { format!("{}/", name) } else { name.clone() },
                    "is_dir": is_dir,
                    "already_cached": cached,
                })
            })
            .collect();

        Ok(json!({
            "path": dir.display().to_string(),
            "entries": listing,
            "total": listing.len(),
        }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let total = raw["total"].as_u64().unwrap_or(0);
        let path = raw["path"].as_str().unwrap_or("").to_string();
        Ok(ToolResponse::new(
            raw,
            format!("listed {} entries in {}", total, path),
        ))
    }
}
