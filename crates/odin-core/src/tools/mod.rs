//! Tool runtime: registry, safeguards, and the per-tool implementations.

pub mod implementations;
pub mod registry;
pub mod safeguard;
pub mod truncation;

pub use registry::{
    parse_params, Services, Tool, ToolContext, ToolOutcome, ToolRegistry, ToolResponse,
};

use std::sync::Arc;

use crate::state::Mode;

/// Read/utility tools available in every mode.
const BASE_CATALOG: &[&str] = &[
    "ls",
    "grep",
    "glob",
    "web_fetch",
    "context_summarizer",
    "execute_command",
    "todo_write",
];

/// Tools added in edit mode only.
const EDIT_CATALOG: &[&str] = &["write_file", "edit", "multiedit", "init"];

/// The tool names a given mode authorizes. Subagents never see `agent`.
pub fn catalog_for_mode(mode: Mode, is_sub_agent: bool) -> Vec<&'static str> {
    let mut catalog: Vec<&'static str> = BASE_CATALOG.to_vec();
    if mode == Mode::Edit {
        catalog.extend_from_slice(EDIT_CATALOG);
    }
    if !is_sub_agent {
        catalog.push("agent");
    }
    catalog
}

/// Build a registry carrying the complete tool catalog. Mode filtering
/// happens at descriptor time via [`catalog_for_mode`].
pub fn build_registry() -> ToolRegistry {
    use implementations::*;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(TodoWriteTool));
    registry.register(Arc::new(LsTool));
    registry.register(Arc::new(GrepTool));
    registry.register(Arc::new(GlobTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(EditTool));
    registry.register(Arc::new(MultiEditTool));
    registry.register(Arc::new(AgentTool));
    registry.register(Arc::new(WebFetchTool));
    registry.register(Arc::new(ContextSummarizerTool));
    registry.register(Arc::new(InitTool));
    registry.register(Arc::new(ExecuteCommandTool));
    registry
}
