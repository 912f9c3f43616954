//! Init tool - discover the repo layout and write `ODIN.md`. Edit mode only.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ToolError;
use crate::state::Mode;
use crate::tools::registry::{Tool, ToolContext, ToolResponse};

pub struct InitTool;

/// Build-file markers and the commands they imply.
const BUILD_MARKERS: &[(&str, &str, &str)] = &[
    ("Cargo.toml", "Rust (cargo)", "cargo build / cargo test"),
    ("package.json", "Node.js (npm)", "npm install / npm test"),
    ("go.mod", "Go", "go build ./... / go test ./..."),
    ("pyproject.toml", "Python", "pip install -e . / pytest"),
    ("Makefile", "Make", "make / make test"),
    ("CMakeLists.txt", "CMake", "cmake -B build && cmake --build build"),
];

#[async_trait]
impl Tool for InitTool {
    fn name(&self) -> &str {
        "init"
    }

    fn description(&self) -> &str {
        "Survey the repository layout and write ODIN.md at the workspace root with overview, architecture, and build/test commands."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    fn is_mutating(&self, _input: &Value) -> bool {
        true
    }

    fn affected_paths(&self, _input: &Value, ctx: &ToolContext) -> Vec<std::path::PathBuf> {
        vec![ctx.state.workspace_root.join("ODIN.md")]
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.mode != Mode::Edit {
            return Err(ToolError::PermissionDenied(
                "init is only available in edit mode".to_string(),
            ));
        }
        Ok(input)
    }

    async fn execute(&self, _input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let root = &ctx.state.workspace_root;
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());

        let mut top_dirs = Vec::new();
        let mut stacks = Vec::new();
        let mut commands = Vec::new();
        let mut read_dir = fs::read_dir(root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let entry_name = entry.file_name().to_string_lossy().to_string();
            if entry_name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                top_dirs.push(entry_name);
            }
        }
        top_dirs.sort();

        for (marker, stack, command) in BUILD_MARKERS {
            if root.join(marker).exists() {
                stacks.push(*stack);
                commands.push(*command);
            }
        }

        let content = render_odin_md(&name, &top_dirs, &stacks, &commands);
        let path = root.join("ODIN.md");
        fs::write(&path, &content).await?;

        Ok(json!({
            "file_path": path.display().to_string(),
            "content": content,
            "directories": top_dirs.len(),
        }))
    }

    async fn post_hook(&self, raw: Value, ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let path = ctx.resolve_path(raw["file_path"].as_str().unwrap_or(""));
        let content = raw["content"].as_str().unwrap_or("");
        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        ctx.state.file_cache.mark_modified(&path, content, mtime);
        ctx.state.reload_instructions();

        let data = json!({ "file_path": raw["file_path"] });
        Ok(ToolResponse::new(
            data,
            format!("wrote {}", path.display()),
        ))
    }
}

fn render_odin_md(name: &str, top_dirs: &[String], stacks: &[&str], commands: &[&str]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", name));

    out.push_str("## Project overview\n\n");
    if stacks.is_empty() {
        out.push_str("No build manifests detected at the root.\n\n");
    } else {
        out.push_str(&format!("Toolchains detected: {}.\n\n", stacks.join(", ")));
    }

    out.push_str("## Architecture\n\nTop-level directories:\n\n");
    for dir in top_dirs {
        out.push_str(&format!("- `{}/`\n", dir));
    }
    out.push('\n');

    out.push_str("## Components and tools\n\n");
    out.push_str("See the directories above; update this section with component notes.\n\n");

    out.push_str("## Run, build, and test\n\n");
    if commands.is_empty() {
        out.push_str("No standard commands detected.\n");
    } else {
        for command in commands {
            out.push_str(&format!("- `{}`\n", command));
        }
    }
    out
}

/// The workspace root is the directory containing `ODIN.md`.
pub fn find_workspace_root(start: &Path) -> Option<std::path::PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join("ODIN.md").is_file() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, test_context_in_mode, ScriptedPlanner};

    #[tokio::test]
    async fn writes_odin_md_with_sections() {
        let (ctx, dir) = test_context(ScriptedPlanner::empty());
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();

        let tool = InitTool;
        let raw = tool.execute(json!({}), &ctx).await.unwrap();
        tool.post_hook(raw, &ctx).await.unwrap();

        let odin = std::fs::read_to_string(dir.path().join("ODIN.md")).unwrap();
        assert!(odin.contains("## Project overview"));
        assert!(odin.contains("## Architecture"));
        assert!(odin.contains("`src/`"));
        assert!(odin.contains("cargo build"));

        // The freshly written file becomes custom instructions.
        assert!(ctx.state.custom_instructions().contains("## Architecture"));
        assert!(ctx
            .state
            .file_cache
            .contains(&dir.path().join("ODIN.md")));
    }

    #[tokio::test]
    async fn edit_mode_required() {
        let (ctx, _dir) = test_context_in_mode(ScriptedPlanner::empty(), Mode::Plan);
        let tool = InitTool;
        let err = tool.pre_hook(json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }

    #[test]
    fn workspace_root_is_directory_containing_odin_md() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("ODIN.md"), "# root").unwrap();

        assert_eq!(find_workspace_root(&nested), Some(dir.path().to_path_buf()));
        assert_eq!(find_workspace_root(Path::new("/nonexistent")), None);
    }
}
