//! Per-tool implementations.

mod agent_tool;
mod context_summarizer;
mod edit;
mod execute_command;
mod glob_tool;
mod grep;
mod init;
mod ls;
mod multiedit;
mod todo_write;
mod web_fetch;
mod write_file;

pub use agent_tool::AgentTool;
pub use context_summarizer::ContextSummarizerTool;
pub use edit::EditTool;
pub use execute_command::ExecuteCommandTool;
pub use glob_tool::GlobTool;
pub use grep::GrepTool;
pub use init::{find_workspace_root, InitTool};
pub use ls::LsTool;
pub use multiedit::MultiEditTool;
pub use todo_write::TodoWriteTool;
pub use web_fetch::WebFetchTool;
pub use write_file::WriteFileTool;

use similar::TextDiff;
use std::path::Path;

/// Compact unified diff (3 context lines) attached to edit-family results.
/// Empty when the contents are identical.
pub(crate) fn unified_edit_diff(path: &Path, before: &str, after: &str) -> String {
    let changes = TextDiff::from_lines(before, after);
    let body: String = changes
        .unified_diff()
        .context_radius(3)
        .iter_hunks()
        .map(|hunk| hunk.to_string())
        .collect();
    if body.is_empty() {
        return body;
    }
    let name = path.display();
    format!("--- {name}\n+++ {name}\n{body}")
}
