//! Planner protocol: input assembly types, wire shapes, and transport.
//!
//! The planner decides the next action each iteration; the driver in
//! [`driver`] feeds it and dispatches whatever it returns.

pub mod driver;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CachedFileSummary;
use crate::state::{ContextItem, Todo};
use retry::{is_retryable_status, IsRetryable};

/// Tool surface advertised to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The latest message as the planner sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub body: String,
    pub todos: Vec<Todo>,
    pub updates: Vec<String>,
}

/// Command policy echoed to the planner so it can avoid dead ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub allowed_commands: Vec<String>,
    pub forbidden_commands: Vec<String>,
}

/// Result of one tool call from the previous iteration, embedded so the
/// planner can adjust strategy after errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultView {
    pub tool_name: String,
    pub ok: bool,
    pub output: Value,
}

/// Everything the planner receives per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerInput {
    pub latest_message: MessageView,
    pub available_tools: Vec<ToolDescriptor>,
    pub context: Vec<ContextItem>,
    pub custom_instructions: String,
    pub config: ConfigView,
    /// Read-time snapshot of the cache.
    pub cached_files: Vec<CachedFileSummary>,
    /// Tool results from the previous iteration, errors included.
    pub tool_results: Vec<ToolResultView>,
}

/// One tool invocation requested by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTool {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

/// Raw response shape: `executeTool` arrives as an object or an array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlannerOutput {
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    task_completed: bool,
    #[serde(default)]
    execute_tool: Option<ScalarOrList>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScalarOrList {
    One(ExecuteTool),
    Many(Vec<ExecuteTool>),
}

/// Normalized planner decision: tool calls are always a list.
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub explanation: String,
    pub task_completed: bool,
    pub calls: Vec<ExecuteTool>,
}

impl PlannerOutput {
    /// Parse and normalize the wire shape. A scalar `executeTool` becomes a
    /// one-element list. Zero calls with the task incomplete is a protocol
    /// error.
    pub fn parse(raw: &str) -> Result<Self, PlannerError> {
        let raw: RawPlannerOutput =
            serde_json::from_str(raw).map_err(|e| PlannerError::protocol(format!(
                "malformed planner response: {}",
                e
            )))?;

        let calls = match raw.execute_tool {
            Some(ScalarOrList::One(call)) => vec![call],
            Some(ScalarOrList::Many(calls)) => calls,
            None => Vec::new(),
        };

        if calls.is_empty() && !raw.task_completed {
            return Err(PlannerError::protocol(
                "planner returned no tool calls without completing the task",
            ));
        }

        Ok(Self {
            explanation: raw.explanation,
            task_completed: raw.task_completed,
            calls,
        })
    }

    pub fn completed(explanation: impl Into<String>) -> Self {
        Self {
            explanation: explanation.into(),
            task_completed: true,
            calls: Vec::new(),
        }
    }
}

/// Transport-level planner failure.
#[derive(Debug)]
pub struct PlannerError {
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    /// Protocol errors never retry.
    pub protocol: bool,
}

impl PlannerError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            protocol: true,
        }
    }

    pub fn transport(message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status,
            retry_after: None,
            protocol: false,
        }
    }
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.protocol {
            write!(f, "planner protocol error: {}", self.message)
        } else if let Some(code) = self.status {
            write!(f, "planner returned status {}: {}", code, self.message)
        } else {
            write!(f, "planner request failed: {}", self.message)
        }
    }
}

impl std::error::Error for PlannerError {}

impl IsRetryable for PlannerError {
    /// Protocol errors never retry: the response arrived and was wrong.
    /// With a status code the server has spoken, so only the transient
    /// codes retry. With no status the request never completed at all
    /// (connect failure, timeout, dropped socket), which is always worth
    /// another attempt within the backoff budget.
    fn is_retryable(&self) -> bool {
        if self.protocol {
            return false;
        }
        self.status.map_or(true, is_retryable_status)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// The planner LLM, seen from the core.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &PlannerInput) -> Result<PlannerOutput, PlannerError>;
}

/// Cheap-model text surface backing `WebFetch` extraction and
/// `ContextSummarizer`.
#[async_trait]
pub trait SmallModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Production planner over HTTP.
pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPlanner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, input: &PlannerInput) -> Result<PlannerOutput, PlannerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(input)
            .send()
            .await
            .map_err(|e| PlannerError::transport(e.to_string(), e.status().map(|s| s.as_u16())))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut err = PlannerError::transport(body, Some(status.as_u16()));
            err.retry_after = retry_after;
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| PlannerError::transport(e.to_string(), None))?;
        PlannerOutput::parse(&body)
    }
}

/// Production cheap-model client over HTTP.
pub struct HttpSmallModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpSmallModel {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl SmallModel for HttpSmallModel {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({ "model": self.model, "prompt": prompt });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}
