//! Error taxonomy for the execution core.
//!
//! Tool-level errors are non-fatal: they become structured tool results the
//! planner sees on its next turn. Loop-level errors terminate the current
//! activation with a diagnostic summary.

use serde::{Deserialize, Serialize};

/// A line range the sufficiency validator suggests reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestedRange {
    pub start_line: usize,
    pub end_line: usize,
    pub reason: String,
}

/// Non-fatal tool failures, surfaced to the planner as tool results.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Input schema violation or constraint failure.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Edit pre-hook rejected: the cache does not carry enough context.
    #[error("cache insufficient: {explanation}")]
    CacheInsufficient {
        explanation: String,
        suggested_ranges: Vec<SuggestedRange>,
    },

    /// `old_string` absent from current on-disk content.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// Path outside the workspace without approval, or a forbidden command.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// mtime or content hash drift detected against the cached entry.
    #[error("file changed externally: {0}")]
    ExternalModification(String),

    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    /// Stable machine-readable code for structured tool results.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "invalid_parameters",
            ToolError::CacheInsufficient { .. } => "cache_insufficient",
            ToolError::TargetNotFound(_) => "target_not_found",
            ToolError::PermissionDenied(_) => "permission_denied",
            ToolError::ExternalModification(_) => "external_modification",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Io(_) => "io_error",
            ToolError::Other(_) => "tool_error",
        }
    }
}

/// Fatal loop failures. These exit the plan-act loop, fill `answer_summary`
/// with a diagnostic, and let the queue drain normally.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Planner/LLM transport failed even after bounded backoff.
    #[error("planner transport failed after {attempts} attempts: {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("iteration limit of {0} exceeded")]
    IterationLimit(usize),

    /// Broken internal invariant (lock misuse, duplicate todo ids, ...).
    #[error("invariant violated: {0}")]
    Invariant(String),
}
