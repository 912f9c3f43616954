//! ContextSummarizer tool - condense accumulated context for prompt budgeting.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::state::ContextItem;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

pub struct ContextSummarizerTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default)]
    focus: Option<String>,
}

#[async_trait]
impl Tool for ContextSummarizerTool {
    fn name(&self) -> &str {
        "context_summarizer"
    }

    fn description(&self) -> &str {
        "Condense the accumulated context and tool history into a short summary, replacing the context items with the condensed form."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "focus": {
                    "type": "string",
                    "description": "Optional aspect to emphasize in the summary"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let items = ctx.state.context_items();
        let message = ctx.state.message_snapshot(ctx.message_index);

        if items.is_empty() && message.tool_history.is_empty() {
            return Ok(json!({ "summary": "", "items_condensed": 0 }));
        }

        let mut prompt = String::from(
            "Condense the following working context into the shortest summary \
             that preserves everything needed to continue the task.\n\n",
        );
        if let Some(focus) = &params.focus {
            prompt.push_str(&format!("Emphasize: {}\n\n", focus));
        }
        for item in &items {
            if let Some(path) = &item.file_path {
                prompt.push_str(&format!("## {}\n", path.display()));
            } else if let Some(cmd) = &item.source_command {
                prompt.push_str(&format!("## output of `{}`\n", cmd));
            }
            prompt.push_str(&item.content);
            prompt.push_str("\n\n");
        }
        if !message.tool_history.is_empty() {
            prompt.push_str("## actions taken so far\n");
            for entry in &message.tool_history {
                prompt.push_str(&format!("- {}\n", entry.description));
            }
        }

        let summary = ctx
            .services
            .small_model
            .complete(&prompt)
            .await
            .map_err(ToolError::Other)?;

        let condensed = items.len();
        ctx.state.replace_context(vec![ContextItem {
            content: summary.clone(),
            file_path: None,
            source_command: None,
        }]);

        Ok(json!({ "summary": summary, "items_condensed": condensed }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let condensed = raw["items_condensed"].as_u64().unwrap_or(0);
        Ok(ToolResponse::new(
            raw,
            format!("condensed {} context items", condensed),
        ))
    }
}
