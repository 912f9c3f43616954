//! Path and command policy enforcement.
//!
//! The workspace root (the directory containing `ODIN.md`) is the safeguard
//! boundary: anything outside it needs explicit user approval. Commands are
//! screened against the configured allow/forbid lists (deny wins) plus a
//! built-in destructive-command screen.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ToolError;
use crate::tools::registry::ToolContext;

/// UI-delegated approval prompt. The policy check lives in-core; the
/// prompting mechanism is injected by the embedding surface.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, request: &str) -> bool;
}

/// Denies everything. Default for non-interactive use.
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn approve(&self, _request: &str) -> bool {
        false
    }
}

/// Approves everything. Test use only.
pub struct AllowAll;

#[async_trait]
impl ApprovalGate for AllowAll {
    async fn approve(&self, _request: &str) -> bool {
        true
    }
}

/// Whether `path` stays inside `root` after lexical normalization.
/// Traversal components are resolved without touching the filesystem, so
/// not-yet-existing targets can be checked too.
pub fn path_within_root(root: &Path, path: &Path) -> bool {
    let normalized = normalize(path);
    normalized.starts_with(normalize(root))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Authorize a filesystem target. Inside the workspace root it passes;
/// outside, the approval gate is consulted once per activation per path.
pub async fn authorize_path(ctx: &ToolContext, path: &Path) -> Result<(), ToolError> {
    if path_within_root(&ctx.state.workspace_root, path) {
        return Ok(());
    }

    let key = format!("path:{}", path.display());
    if ctx.is_approved(&key) {
        return Ok(());
    }

    // stdin_mx: one prompt at a time across concurrent tools.
    let approved = {
        let _guard = ctx.state.stdin_guard().await;
        ctx.services
            .approval
            .approve(&format!(
                "allow access to '{}' outside the workspace root?",
                path.display()
            ))
            .await
    };

    if approved {
        ctx.remember_approval(&key);
        Ok(())
    } else {
        Err(ToolError::PermissionDenied(format!(
            "path '{}' is outside the workspace root",
            path.display()
        )))
    }
}

/// Authorize a shell command: forbid list first (deny wins, never
/// promptable), then the allow list (promptable), then the built-in
/// destructive-command screen.
pub async fn authorize_command(ctx: &ToolContext, command: &str) -> Result<(), ToolError> {
    use crate::config::CommandDenial;

    match ctx.state.config.command_allowed(command) {
        Ok(()) => {}
        Err(denial @ CommandDenial::Forbidden(_)) => {
            return Err(ToolError::PermissionDenied(denial.to_string()));
        }
        Err(denial @ CommandDenial::NotAllowed) => {
            let key = format!("command:{}", command);
            if !ctx.is_approved(&key) {
                let approved = {
                    let _guard = ctx.state.stdin_guard().await;
                    ctx.services
                        .approval
                        .approve(&format!("allow command '{}'? ({})", command, denial))
                        .await
                };
                if approved {
                    ctx.remember_approval(&key);
                } else {
                    return Err(ToolError::PermissionDenied(denial.to_string()));
                }
            }
        }
    }

    if let Some(reason) = screen_command(command) {
        return Err(ToolError::PermissionDenied(format!(
            "refusing destructive command: {}",
            reason
        )));
    }

    Ok(())
}

// Whole-line patterns that don't reduce to a single program word.
static CLASSIC_FORK_BOMB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\(\)\s*\{[^}]*:\s*\|\s*:[^}]*\}").expect("valid regex"));
static FETCH_PIPED_TO_SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(curl|wget)\b[^|;]*\|\s*(sh|bash|zsh|dash)\b").expect("valid regex")
});
static REDIRECT_TO_BLOCK_DEVICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)>{1,2}\s*/dev/(sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|disk\d*)")
        .expect("valid regex")
});

/// Hard screen for commands too destructive to run even when the policy
/// lists would allow them. Returns a human-readable reason when tripped.
pub fn screen_command(command: &str) -> Option<String> {
    if CLASSIC_FORK_BOMB.is_match(command) {
        return Some("fork bomb pattern".to_string());
    }
    if FETCH_PIPED_TO_SHELL.is_match(command) {
        return Some("remote script piped into a shell".to_string());
    }
    if REDIRECT_TO_BLOCK_DEVICE.is_match(command) {
        return Some("redirect into a raw block device".to_string());
    }

    for part in split_compound(command) {
        let words = words_of(&part);
        let words = &words[assignment_prefix_len(&words)..];
        let Some(program) = words.first().map(|w| w.to_ascii_lowercase()) else {
            continue;
        };
        let args = &words[1..];

        match program.as_str() {
            "sudo" | "doas" | "su" => return Some("privilege elevation".to_string()),
            "rm" if rm_hits_protected_target(args) => {
                return Some("recursive forced delete of a protected path".to_string());
            }
            "chmod" if args.iter().any(|a| a.trim_start_matches('0') == "777") => {
                return Some("chmod to world-writable 777".to_string());
            }
            "dd" if args
                .iter()
                .any(|a| a.starts_with("if=/dev/") || a.starts_with("of=/dev/")) =>
            {
                return Some("dd against a raw device".to_string());
            }
            _ if program.starts_with("mkfs") => {
                return Some("filesystem formatting".to_string());
            }
            _ => {}
        }
    }

    None
}

/// Break a compound command line into simple commands. Separators (`;`,
/// `|`, `&`, newline) split only outside quotes; doubled separators just
/// produce empty pieces, which are dropped.
fn split_compound(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in command.chars() {
        if escaped {
            buf.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quote != Some('\'') => {
                buf.push(ch);
                escaped = true;
            }
            '\'' | '"' => {
                match quote {
                    Some(open) if open == ch => quote = None,
                    None => quote = Some(ch),
                    Some(_) => {}
                }
                buf.push(ch);
            }
            ';' | '|' | '&' | '\n' if quote.is_none() => {
                if !buf.trim().is_empty() {
                    parts.push(buf.trim().to_string());
                }
                buf.clear();
            }
            _ => buf.push(ch),
        }
    }
    if !buf.trim().is_empty() {
        parts.push(buf.trim().to_string());
    }
    parts
}

fn words_of(part: &str) -> Vec<String> {
    shell_words::split(part)
        .unwrap_or_else(|_| part.split_whitespace().map(str::to_string).collect())
}

/// Count leading `NAME=value` environment assignments.
fn assignment_prefix_len(words: &[String]) -> usize {
    words
        .iter()
        .take_while(|word| match word.split_once('=') {
            Some((name, _)) => {
                !name.is_empty()
                    && name
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        })
        .count()
}

fn rm_hits_protected_target(args: &[String]) -> bool {
    let mut recursive = false;
    let mut forced = false;
    let mut targets: Vec<&str> = Vec::new();

    for arg in args {
        match arg.strip_prefix('-') {
            Some(flags) => {
                recursive |= flags.contains('r') || flags.contains('R');
                forced |= flags.contains('f') || arg == "--force";
            }
            None => targets.push(arg),
        }
    }

    recursive && forced && targets.iter().any(|t| is_protected_path(t))
}

fn is_protected_path(target: &str) -> bool {
    let trimmed = target.trim_end_matches('*');
    if matches!(
        trimmed,
        "/" | "~" | "~/" | "$HOME" | "$HOME/" | "${HOME}" | "${HOME}/"
    ) {
        return true;
    }
    ["/etc", "/usr", "/var", "/boot", "/bin", "/lib"]
        .iter()
        .any(|base| trimmed == *base || trimmed.starts_with(&format!("{}/", base)))
}
