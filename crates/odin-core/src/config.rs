//! Configuration loaded from `odinconfig.json` at the workspace root.
//!
//! Unknown keys are ignored. Deny wins where the allow and forbid lists
//! overlap.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::cache::FileCacheConfig;

pub const CONFIG_FILE: &str = "odinconfig.json";

/// Default ceiling on planner↔tool turns per message.
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub forbidden_commands: Vec<String>,
    #[serde(default)]
    pub file_cache: FileCacheConfig,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            forbidden_commands: Vec::new(),
            file_cache: FileCacheConfig::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl Config {
    /// Load from `<workspace_root>/odinconfig.json`. A missing file yields
    /// the defaults; a malformed file is an error.
    pub fn load(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = workspace_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Command policy check. Matching is prefix-based over shell tokens, so
    /// `"git push"` covers `git push --force` but not `git pushremote`.
    /// Deny wins on overlap.
    pub fn command_allowed(&self, command: &str) -> Result<(), CommandDenial> {
        let tokens = shell_words::split(command)
            .unwrap_or_else(|_| command.split_whitespace().map(ToString::to_string).collect());

        for pattern in &self.forbidden_commands {
            if matches_prefix(&tokens, pattern) {
                return Err(CommandDenial::Forbidden(pattern.clone()));
            }
        }

        if self.allowed_commands.is_empty() {
            return Ok(());
        }
        for pattern in &self.allowed_commands {
            if matches_prefix(&tokens, pattern) {
                return Ok(());
            }
        }
        Err(CommandDenial::NotAllowed)
    }
}

/// Why a command failed the policy check. Forbidden matches never get an
/// approval prompt; unlisted commands may.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDenial {
    Forbidden(String),
    NotAllowed,
}

impl std::fmt::Display for CommandDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandDenial::Forbidden(pattern) => {
                write!(f, "command matches forbidden pattern '{}'", pattern)
            }
            CommandDenial::NotAllowed => write!(f, "command not in allowed list"),
        }
    }
}

fn matches_prefix(tokens: &[String], pattern: &str) -> bool {
    let pattern_tokens = shell_words::split(pattern)
        .unwrap_or_else(|_| pattern.split_whitespace().map(ToString::to_string).collect());
    if pattern_tokens.is_empty() || pattern_tokens.len() > tokens.len() {
        return false;
    }
    pattern_tokens
        .iter()
        .zip(tokens)
        .all(|(want, have)| want == have)
}
