//! ExecuteCommand tool - run a shell command under the safeguard policy.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};
use crate::tools::safeguard;
use crate::tools::truncation::strip_ansi;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_LINES: usize = 2000;
const MAX_OUTPUT_BYTES: usize = 50_000;

pub struct ExecuteCommandTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    description: Option<String>,
}

/// Tail capture of command output: only the newest lines survive the line
/// and byte caps, and the number of discarded older lines is reported in
/// the rendered text.
struct TailCapture {
    kept: VecDeque<String>,
    bytes: usize,
    discarded: usize,
}

impl TailCapture {
    fn new() -> Self {
        Self {
            kept: VecDeque::new(),
            bytes: 0,
            discarded: 0,
        }
    }

    fn record(&mut self, line: String) {
        let line = clamp_line(line, MAX_OUTPUT_BYTES);
        self.bytes += line.len();
        self.kept.push_back(line);

        // Shed from the front, but never drop the line just recorded.
        while self.kept.len() > 1
            && (self.kept.len() > MAX_OUTPUT_LINES || self.bytes > MAX_OUTPUT_BYTES)
        {
            let oldest = self.kept.pop_front().expect("non-empty");
            self.bytes -= oldest.len();
            self.discarded += 1;
        }
    }

    fn render(self) -> String {
        let tail = Vec::from(self.kept).join("\n");
        if self.discarded == 0 {
            return tail;
        }
        let notice = format!("[output trimmed: first {} line(s) dropped]", self.discarded);
        if tail.is_empty() {
            notice
        } else {
            format!("{}\n{}", notice, tail)
        }
    }
}

/// Keep the tail of a single oversized line, respecting UTF-8 boundaries.
fn clamp_line(line: String, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line;
    }
    let mut cut = line.len() - max_bytes;
    while cut < line.len() && !line.is_char_boundary(cut) {
        cut += 1;
    }
    line[cut..].to_string()
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace root. Output is captured with ANSI stripped and bounded buffers; the command policy and dangerous-pattern screen apply."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                },
                "timeout_secs": {
                    "type": "number",
                    "description": "Kill the command after this many seconds (default: 120)"
                },
                "description": {
                    "type": "string",
                    "description": "One-line description of what the command does"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn is_mutating(&self, input: &Value) -> bool {
        // Only treated as mutating for collision purposes when it names
        // absolute paths it could write to.
        !self.affected_paths_from_command(input).is_empty()
    }

    fn affected_paths(&self, input: &Value, _ctx: &ToolContext) -> Vec<PathBuf> {
        self.affected_paths_from_command(input)
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input.clone())?;
        if params.command.trim().is_empty() {
            return Err(ToolError::Validation("command must not be empty".to_string()));
        }

        safeguard::authorize_command(ctx, &params.command).await?;

        // Absolute path arguments outside the workspace need approval too.
        for path in self.affected_paths_from_command(&input) {
            safeguard::authorize_path(ctx, &path).await?;
        }

        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let timeout = Duration::from_secs(
            params.timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.state.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

            // Drain both pipes concurrently so neither can fill and stall
            // the child.
            async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<String> {
                let mut out = Vec::new();
                if let Some(reader) = reader {
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        out.push(line);
                        if out.len() > MAX_OUTPUT_LINES * 4 {
                            // Keep the tail; older lines fall out below anyway.
                            out.remove(0);
                        }
                    }
                }
                out
            }

            let (out_lines, err_lines) = tokio::join!(collect_lines(stdout), collect_lines(stderr));

            let mut capture = TailCapture::new();
            for line in out_lines.into_iter().chain(err_lines) {
                capture.record(strip_ansi(&line));
            }

            let status = child.wait().await?;
            Ok::<_, std::io::Error>((capture, status))
        };

        let (capture, status) = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: self.name().to_string(),
                    secs: timeout.as_secs(),
                })
            }
        };

        Ok(json!({
            "command": params.command,
            "description": params.description,
            "output": capture.render(),
            "exit_code": status.code(),
            "success": status.success(),
        }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let command = raw["command"].as_str().unwrap_or("").to_string();
        let exit_code = raw["exit_code"].as_i64();
        let description = raw["description"]
            .as_str()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("ran `{}`", command));

        let summary = match exit_code {
            Some(0) => description,
            Some(code) => format!("{} (exit {})", description, code),
            None => format!("{} (killed)", description),
        };
        Ok(ToolResponse::new(raw, summary))
    }
}

impl ExecuteCommandTool {
    fn affected_paths_from_command(&self, input: &Value) -> Vec<PathBuf> {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        let tokens = shell_words::split(command).unwrap_or_default();
        tokens
            .iter()
            .filter(|t| t.starts_with('/'))
            .map(PathBuf::from)
            .collect()
    }
}
