//! Grep tool - ripgrep-backed search that feeds the file cache.
//!
//! In content mode the tool caches what it read: a window covering the
//! whole file becomes a full entry, anything narrower becomes line-range
//! segments. Repeat content searches against a single file with a fresh
//! full entry are answered from the cache without spawning `rg`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::cache::CachedSegment;
use crate::error::ToolError;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

pub struct GrepTool;

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_output_mode")]
    output_mode: String,
    #[serde(rename = "-i", default)]
    case_insensitive: bool,
    #[serde(rename = "-n", default = "default_true")]
    line_numbers: bool,
    #[serde(rename = "-A", default)]
    after: Option<usize>,
    #[serde(rename = "-B", default)]
    before: Option<usize>,
    #[serde(rename = "-C", default)]
    around: Option<usize>,
    #[serde(default)]
    head_limit: Option<usize>,
    #[serde(default)]
    multiline: bool,
    #[serde(default)]
    glob: Option<String>,
    #[serde(rename = "type", default)]
    file_type: Option<String>,
}

fn default_output_mode() -> String {
    "files_with_matches".to_string()
}

fn default_true() -> bool {
    true
}

impl Params {
    fn context_lines(&self) -> (usize, usize) {
        match self.around {
            Some(c) => (c, c),
            None => (self.before.unwrap_or(0), self.after.unwrap_or(0)),
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with ripgrep regex syntax. output_mode selects content, files_with_matches, or count. Content searches populate the file cache."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regex pattern to search for" },
                "path": { "type": "string", "description": "File or directory to search (default: workspace root)" },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "default": "files_with_matches"
                },
                "-i": { "type": "boolean", "description": "Case insensitive" },
                "-n": { "type": "boolean", "description": "Show line numbers (content mode)", "default": true },
                "-A": { "type": "number", "description": "Lines of context after each match" },
                "-B": { "type": "number", "description": "Lines of context before each match" },
                "-C": { "type": "number", "description": "Lines of context around each match" },
                "head_limit": { "type": "number", "description": "Cap output lines" },
                "multiline": { "type": "boolean", "description": "Allow patterns to span lines" },
                "glob": { "type": "string", "description": "Restrict files by glob" },
                "type": { "type": "string", "description": "Restrict files by ripgrep type" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn pre_hook(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input.clone())?;
        if params.pattern.is_empty() {
            return Err(ToolError::Validation("pattern must not be empty".into()));
        }
        if !matches!(
            params.output_mode.as_str(),
            "content" | "files_with_matches" | "count"
        ) {
            return Err(ToolError::Validation(format!(
                "unknown output_mode '{}'",
                params.output_mode
            )));
        }
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let target = match &params.path {
            Some(p) => ctx.resolve_path(p),
            None => ctx.state.workspace_root.clone(),
        };

        // Cache fast path: repeat content search on one fully cached file.
        if params.output_mode == "content" && !params.multiline && target.is_file() {
            if let Some(view) = ctx.state.file_cache.get(&target) {
                if let Some(content) = view.full_content {
                    return self.search_cached(&params, &target, &content);
                }
            }
        }

        match params.output_mode.as_str() {
            "files_with_matches" => self.run_files_with_matches(&params, &target).await,
            "count" => self.run_count(&params, &target).await,
            _ => self.run_content(&params, &target, ctx).await,
        }
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let mode = raw["output_mode"].as_str().unwrap_or("").to_string();
        let matches = raw["total_matches"].as_u64().unwrap_or(0);
        let pattern = raw["pattern"].as_str().unwrap_or("").to_string();
        Ok(ToolResponse::new(
            raw,
            format!("grep '{}' ({}): {} matches", pattern, mode, matches),
        ))
    }
}

impl GrepTool {
    fn base_args(&self, params: &Params, target: &Path) -> Vec<String> {
        let mut args = vec!["--color".into(), "never".into(), "--no-heading".into()];
        if params.case_insensitive {
            args.push("-i".into());
        }
        if params.multiline {
            args.push("-U".into());
            args.push("--multiline-dotall".into());
        }
        if let Some(glob) = &params.glob {
            args.push("--glob".into());
            args.push(glob.clone());
        }
        if let Some(file_type) = &params.file_type {
            args.push("--type".into());
            args.push(file_type.clone());
        }
        args.push("--".into());
        args.push(params.pattern.clone());
        args.push(target.display().to_string());
        args
    }

    async fn run_rg(&self, args: &[String]) -> Result<String, ToolError> {
        let output = Command::new("rg")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ToolError::Other(anyhow::anyhow!("failed to spawn rg (is ripgrep installed?): {}", e))
            })?;

        match output.status.code() {
            // 0 = matches, 1 = no matches.
            Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            _ => Err(ToolError::Other(anyhow::anyhow!(
                "rg failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))),
        }
    }

    async fn run_files_with_matches(&self, params: &Params, target: &Path) -> Result<Value, ToolError> {
        let mut args = vec!["-l".to_string()];
        args.extend(self.base_args(params, target));
        let stdout = self.run_rg(&args).await?;

        let mut files: Vec<&str> = stdout.lines().collect();
        if let Some(limit) = params.head_limit {
            files.truncate(limit);
        }
        Ok(json!({
            "pattern": params.pattern,
            "output_mode": "files_with_matches",
            "files": files,
            "total_matches": files.len(),
        }))
    }

    async fn run_count(&self, params: &Params, target: &Path) -> Result<Value, ToolError> {
        // --with-filename keeps the "file:count" shape even for a single
        // file target.
        let mut args = vec!["-c".to_string(), "--with-filename".to_string()];
        args.extend(self.base_args(params, target));
        let stdout = self.run_rg(&args).await?;

        let mut counts = Vec::new();
        let mut total = 0u64;
        for line in stdout.lines() {
            let (file, count) = match line.rsplit_once(':') {
                Some((file, count)) => (file, count.parse::<u64>().unwrap_or(0)),
                None => (line, 0),
            };
            total += count;
            counts.push(json!({ "file": file, "count": count }));
        }
        if let Some(limit) = params.head_limit {
            counts.truncate(limit);
        }
        Ok(json!({
            "pattern": params.pattern,
            "output_mode": "count",
            "counts": counts,
            "total_matches": total,
        }))
    }

    async fn run_content(
        &self,
        params: &Params,
        target: &Path,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        // Match discovery only; context windows are computed here so the
        // exact cached ranges are known.
        let mut args = vec![
            "--line-number".to_string(),
            "--with-filename".to_string(),
        ];
        args.extend(self.base_args(params, target));
        let stdout = self.run_rg(&args).await?;

        let mut match_lines: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for line in stdout.lines() {
            let Some((file, rest)) = line.split_once(':') else {
                continue;
            };
            let Some((line_no, _)) = rest.split_once(':') else {
                continue;
            };
            if let Ok(n) = line_no.parse::<usize>() {
                match_lines.entry(PathBuf::from(file)).or_default().push(n);
            }
        }

        let (before, after) = params.context_lines();
        let mut output = String::new();
        let mut total_matches = 0usize;
        let mut emitted_lines = 0usize;
        let head_limit = params.head_limit.unwrap_or(usize::MAX);
        let mut truncated = false;

        'files: for (file, lines) in &match_lines {
            total_matches += lines.len();
            let content = match tokio::fs::read_to_string(file).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let mtime = std::fs::metadata(file).ok().and_then(|m| m.modified().ok());
            let file_lines: Vec<&str> = content.lines().collect();
            let total_lines = file_lines.len();

            let windows = merge_windows(lines, before, after, total_lines);

            // Cache what was read.
            if windows.len() == 1 && windows[0] == (1, total_lines) {
                let cached = ctx.state.file_cache.put_full(file, &content, mtime);
                if !cached {
                    truncated = true;
                }
            } else {
                for &(start, end) in &windows {
                    let slice = file_lines[start - 1..end].join("\n");
                    ctx.state
                        .file_cache
                        .put_segment(file, CachedSegment::new(start, end, slice), mtime);
                }
            }

            for (start, end) in windows {
                if emitted_lines >= head_limit {
                    truncated = true;
                    break 'files;
                }
                if !output.is_empty() {
                    output.push_str("--\n");
                }
                for (offset, text) in file_lines[start - 1..end].iter().enumerate() {
                    if emitted_lines >= head_limit {
                        truncated = true;
                        break;
                    }
                    if params.line_numbers {
                        output.push_str(&format!("{}:{}:{}\n", file.display(), start + offset, text));
                    } else {
                        output.push_str(&format!("{}:{}\n", file.display(), text));
                    }
                    emitted_lines += 1;
                }
            }
        }

        Ok(json!({
            "pattern": params.pattern,
            "output_mode": "content",
            "content": output,
            "total_matches": total_matches,
            "truncated": truncated,
        }))
    }

    /// Serve a content search from a fresh full cache entry.
    fn search_cached(&self, params: &Params, target: &Path, content: &str) -> Result<Value, ToolError> {
        let mut pattern = params.pattern.clone();
        if params.case_insensitive {
            pattern = format!("(?i){}", pattern);
        }
        let re = regex::Regex::new(&pattern)
            .map_err(|e| ToolError::Validation(format!("bad pattern: {}", e)))?;

        let file_lines: Vec<&str> = content.lines().collect();
        let matches: Vec<usize> = file_lines
            .iter()
            .enumerate()
            .filter(|(_, l)| re.is_match(l))
            .map(|(i, _)| i + 1)
            .collect();

        let (before, after) = params.context_lines();
        let windows = merge_windows(&matches, before, after, file_lines.len());
        let head_limit = params.head_limit.unwrap_or(usize::MAX);

        let mut output = String::new();
        let mut emitted = 0usize;
        'windows: for (start, end) in windows {
            if !output.is_empty() {
                output.push_str("--\n");
            }
            for (offset, text) in file_lines[start - 1..end].iter().enumerate() {
                if emitted >= head_limit {
                    break 'windows;
                }
                if params.line_numbers {
                    output.push_str(&format!("{}:{}:{}\n", target.display(), start + offset, text));
                } else {
                    output.push_str(&format!("{}:{}\n", target.display(), text));
                }
                emitted += 1;
            }
        }

        Ok(json!({
            "pattern": params.pattern,
            "output_mode": "content",
            "content": output,
            "total_matches": matches.len(),
            "truncated": false,
            "cache_hit": true,
        }))
    }
}

/// Expand match lines into [start, end] windows (1-indexed, inclusive) and
/// merge any that touch or overlap.
fn merge_windows(
    match_lines: &[usize],
    before: usize,
    after: usize,
    total_lines: usize,
) -> Vec<(usize, usize)> {
    let mut sorted: Vec<usize> = match_lines.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut windows: Vec<(usize, usize)> = Vec::new();
    for &line in &sorted {
        let start = line.saturating_sub(before).max(1);
        let end = (line + after).min(total_lines.max(1));
        match windows.last_mut() {
            Some((_, prev_end)) if start <= *prev_end + 1 => {
                *prev_end = (*prev_end).max(end);
            }
            _ => windows.push((start, end)),
        }
    }
    windows
}
