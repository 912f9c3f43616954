//! Agent tool - spawn a subagent with its own plan-act loop.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent;
use crate::error::ToolError;
use crate::state::Mode;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

pub struct AgentTool;

#[derive(Deserialize)]
struct Params {
    task: String,
    #[serde(default)]
    mode: Option<Mode>,
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Delegate a task to a subagent running its own plan-act loop. The subagent inherits context read-only and cannot spawn further subagents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the subagent should accomplish"
                },
                "mode": {
                    "type": "string",
                    "enum": ["ask", "plan", "edit"],
                    "description": "Authorization mode for the subagent (default: the current mode)"
                }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    async fn pre_hook(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        // The catalog already omits this tool for subagents; this guard
        // covers direct dispatch.
        if ctx.is_sub_agent {
            return Err(ToolError::PermissionDenied(
                "subagents cannot spawn further subagents".to_string(),
            ));
        }
        let params: Params = parse_params(input.clone())?;
        if params.task.trim().is_empty() {
            return Err(ToolError::Validation("task must not be empty".to_string()));
        }
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let mode = params.mode.unwrap_or(ctx.mode);

        let answer = agent::run_sub_agent(ctx, mode, &params.task)
            .await
            .map_err(|e| ToolError::Other(anyhow::anyhow!("subagent failed: {}", e)))?;

        Ok(json!({
            "task": params.task,
            "mode": mode.to_string(),
            "answer": answer,
        }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let mode = raw["mode"].as_str().unwrap_or("").to_string();
        Ok(ToolResponse::new(
            raw,
            format!("subagent ({}) completed", mode),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannerOutput;
    use crate::test_support::{test_context, test_context_sub_agent, ScriptedPlanner};

    #[tokio::test]
    async fn spawns_subagent_and_returns_its_answer() {
        let (ctx, _dir) = test_context(ScriptedPlanner::with(vec![PlannerOutput::completed(
            "child answer",
        )]));

        let tool = AgentTool;
        let input = json!({"task": "summarize the repo", "mode": "ask"});
        let phr = tool.pre_hook(input, &ctx).await.unwrap();
        let raw = tool.execute(phr, &ctx).await.unwrap();
        assert_eq!(raw["answer"], "child answer");

        // Child deregistered itself on exit.
        assert!(ctx.state.sub_agent_handles().is_empty());
    }

    #[tokio::test]
    async fn sub_agents_cannot_recurse() {
        let (ctx, _dir) = test_context_sub_agent(ScriptedPlanner::empty());
        let tool = AgentTool;
        let err = tool
            .pre_hook(json!({"task": "go deeper"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn empty_task_rejected() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = AgentTool;
        let err = tool.pre_hook(json!({"task": "  "}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
