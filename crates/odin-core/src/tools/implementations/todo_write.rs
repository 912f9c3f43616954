//! TodoWrite tool - overwrite the current message's todo list.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::state::{Todo, TodoStatus};
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

pub struct TodoWriteTool;

#[derive(Deserialize)]
struct Params {
    todos: Vec<Todo>,
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Overwrite the task todo list. Ids must be unique, content non-empty, and at most one item may be in_progress."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string", "description": "Decimal integer id" },
                            "status": { "type": "string", "enum": ["pending", "in_progress", "completed"] },
                            "content": { "type": "string" }
                        },
                        "required": ["id", "status", "content"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    async fn pre_hook(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        // Shape and static constraints; the revert check runs against the
        // live message in execute.
        let params: Params = parse_params(input.clone())?;
        let mut seen = std::collections::HashSet::new();
        let mut in_progress = 0usize;
        for todo in &params.todos {
            if !seen.insert(todo.id) {
                return Err(ToolError::Validation(format!("duplicate todo id {}", todo.id)));
            }
            if todo.content.trim().is_empty() {
                return Err(ToolError::Validation(format!("todo {} has empty content", todo.id)));
            }
            if todo.status == TodoStatus::InProgress {
                in_progress += 1;
            }
        }
        if in_progress > 1 {
            return Err(ToolError::Validation(
                "more than one todo is in_progress".to_string(),
            ));
        }
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;
        let count = params.todos.len();
        ctx.state
            .with_message(ctx.message_index, |m| m.apply_todos(params.todos))?;
        Ok(json!({ "count": count }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let count = raw["count"].as_u64().unwrap_or(0);
        Ok(ToolResponse::new(
            raw,
            format!("updated todo list ({} items)", count),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, ScriptedPlanner};

    fn todos_input(items: &[(&str, &str, &str)]) -> Value {
        json!({
            "todos": items.iter().map(|(id, status, content)| json!({
                "id": id, "status": status, "content": content
            })).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn writes_todos_onto_current_message() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = TodoWriteTool;
        let input = todos_input(&[("1", "in_progress", "read the code"), ("2", "pending", "fix it")]);

        let phr = tool.pre_hook(input, &ctx).await.unwrap();
        let raw = tool.execute(phr, &ctx).await.unwrap();
        let response = tool.post_hook(raw, &ctx).await.unwrap();

        assert!(response.description.contains("2 items"));
        let msg = ctx.state.message_snapshot(ctx.message_index);
        assert_eq!(msg.todos.len(), 2);
        assert_eq!(msg.todos[0].id, 1);
    }

    #[tokio::test]
    async fn duplicate_ids_rejected_in_pre_hook() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = TodoWriteTool;
        let input = todos_input(&[("1", "pending", "a"), ("1", "pending", "b")]);
        let err = tool.pre_hook(input, &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn two_in_progress_rejected() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = TodoWriteTool;
        let input = todos_input(&[("1", "in_progress", "a"), ("2", "in_progress", "b")]);
        assert!(tool.pre_hook(input, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn omitting_a_completed_todo_is_rejected() {
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let tool = TodoWriteTool;

        let first = todos_input(&[("1", "completed", "shipped"), ("2", "pending", "next")]);
        let phr = tool.pre_hook(first, &ctx).await.unwrap();
        tool.execute(phr, &ctx).await.unwrap();

        // The pre-hook cannot see the live message, so the omission is
        // caught at execute time and the todo state survives unchanged.
        let second = todos_input(&[("2", "in_progress", "next")]);
        let phr = tool.pre_hook(second, &ctx).await.unwrap();
        let err = tool.execute(phr, &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let msg = ctx.state.message_snapshot(ctx.message_index);
        assert_eq!(msg.todos.len(), 2);
        assert_eq!(msg.todos[0].content, "shipped");
    }
}
