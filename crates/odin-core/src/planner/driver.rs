//! The plan-act loop: feed the planner, dispatch what it returns, repeat
//! until it declares the task complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::LoopError;
use crate::planner::retry::{with_retry, RetryConfig};
use crate::planner::{ConfigView, MessageView, PlannerInput, ToolResultView};
use crate::state::{Mode, State, ToolHistoryEntry};
use crate::tools::registry::{Services, ToolContext};
use crate::tools::truncation::truncate_output;
use crate::tools::{catalog_for_mode, ToolRegistry};

/// Everything one plan-act loop runs against.
pub struct DriverEnv {
    pub state: Arc<State>,
    pub services: Arc<Services>,
    pub registry: Arc<ToolRegistry>,
    /// Parent state for subagent context inheritance. Read-only; never
    /// keeps the parent alive.
    pub parent: Option<Weak<State>>,
    /// Graceful-exit flag: checked between iterations, so an in-flight
    /// tool call always finishes first.
    pub kill: Arc<AtomicBool>,
    pub retry: RetryConfig,
}

/// Drive `message_index` to completion. Returns the final answer summary.
pub async fn run_loop(
    env: &DriverEnv,
    message_index: usize,
    mode: Mode,
    is_sub_agent: bool,
) -> Result<String, LoopError> {
    let catalog = catalog_for_mode(mode, is_sub_agent);
    let max_iterations = env.state.config.max_iterations;
    let ctx = ToolContext::new(
        env.state.clone(),
        env.services.clone(),
        mode,
        is_sub_agent,
        message_index,
    );

    let mut last_results: Vec<ToolResultView> = Vec::new();

    for iteration in 1..=max_iterations {
        if env.kill.load(Ordering::SeqCst) {
            tracing::info!(iteration, "loop marked for graceful exit");
            return Ok("stopped before completion".to_string());
        }

        let input = build_input(env, &catalog, message_index, &last_results);

        let output = with_retry(&env.retry, || env.services.planner.plan(&input))
            .await
            .map_err(|(attempts, err)| LoopError::Transport {
                attempts,
                source: anyhow::anyhow!(err),
            })?;

        if output.task_completed {
            tracing::info!(iteration, "planner declared task complete");
            return Ok(output.explanation);
        }

        if !output.explanation.is_empty() {
            env.state.with_message(message_index, |m| {
                m.updates.push(output.explanation.clone());
            });
        }
        env.state.with_message(message_index, |m| {
            for call in &output.calls {
                m.updates.push(format!("running {} ...", call.tool_name));
            }
        });

        let outcomes = env.registry.execute_batch(&output.calls, &ctx).await;

        // History is appended in completion order, which may differ from
        // issue order for parallel batches; results return to the planner
        // in issue order regardless.
        let mut by_completion: Vec<&crate::tools::ToolOutcome> = outcomes.iter().collect();
        by_completion.sort_by_key(|o| o.completion_rank);
        env.state.with_message(message_index, |m| {
            for outcome in &by_completion {
                m.tool_history.push(ToolHistoryEntry {
                    tool_name: outcome.tool_name.clone(),
                    affected_files: outcome.affected_files.clone(),
                    description: outcome.description.clone(),
                });
                m.updates.push(outcome.description.clone());
            }
        });

        last_results = outcomes
            .iter()
            .map(|o| ToolResultView {
                tool_name: o.tool_name.clone(),
                ok: o.ok,
                output: truncate_payload(&o.payload),
            })
            .collect();
    }

    Err(LoopError::IterationLimit(max_iterations))
}

/// Assemble the planner input from a read-time snapshot of state.
fn build_input(
    env: &DriverEnv,
    catalog: &[&str],
    message_index: usize,
    last_results: &[ToolResultView],
) -> PlannerInput {
    let message = env.state.message_snapshot(message_index);

    // Subagents inherit parent context read-only through the weak link.
    let mut context = match env.parent.as_ref().and_then(Weak::upgrade) {
        Some(parent) => parent.context_items(),
        None => Vec::new(),
    };
    context.extend(env.state.context_items());

    PlannerInput {
        latest_message: MessageView {
            body: message.body,
            todos: message.todos,
            updates: message.updates,
        },
        available_tools: env.registry.descriptors(catalog),
        context,
        custom_instructions: env.state.custom_instructions(),
        config: ConfigView {
            allowed_commands: env.state.config.allowed_commands.clone(),
            forbidden_commands: env.state.config.forbidden_commands.clone(),
        },
        cached_files: env.state.file_cache.summary(),
        tool_results: last_results.to_vec(),
    }
}

fn truncate_payload(payload: &serde_json::Value) -> serde_json::Value {
    match serde_json::to_string(payload) {
        Ok(s) if s.len() > crate::tools::truncation::MAX_TOOL_OUTPUT_CHARS => {
            serde_json::Value::String(truncate_output(&s))
        }
        _ => payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ExecuteTool, PlannerOutput};
    use crate::test_support::{test_env, ScriptedPlanner};
    use serde_json::json;

    fn grep_call(pattern: &str, path: &str) -> ExecuteTool {
        ExecuteTool {
            tool_name: "grep".into(),
            tool_input: json!({"pattern": pattern, "path": path, "output_mode": "content"}),
        }
    }

    #[tokio::test]
    async fn completion_returns_explanation() {
        let planner = ScriptedPlanner::with(vec![PlannerOutput::completed("nothing to do")]);
        let (env, _dir) = test_env(planner);
        let idx = env.state.append_message(crate::state::Message::new("hi"));

        let answer = run_loop(&env, idx, Mode::Ask, false).await.unwrap();
        assert_eq!(answer, "nothing to do");
    }

    #[tokio::test]
    async fn tool_errors_reach_the_next_planner_input() {
        // First turn asks for an unknown tool; the scripted planner records
        // the inputs it sees, so the error from turn 1 must appear in turn 2.
        let planner = ScriptedPlanner::with(vec![
            PlannerOutput {
                explanation: String::new(),
                task_completed: false,
                calls: vec![ExecuteTool {
                    tool_name: "no_such_tool".into(),
                    tool_input: json!({}),
                }],
            },
            PlannerOutput::completed("gave up"),
        ]);
        let inputs = planner.seen_inputs();
        let (env, _dir) = test_env(planner);
        let idx = env.state.append_message(crate::state::Message::new("try"));

        run_loop(&env, idx, Mode::Ask, false).await.unwrap();

        let seen = inputs.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].tool_results.is_empty());
        assert_eq!(seen[1].tool_results.len(), 1);
        assert!(!seen[1].tool_results[0].ok);
    }

    #[tokio::test]
    async fn iteration_cap_is_fatal() {
        let planner = ScriptedPlanner::looping(PlannerOutput {
            explanation: String::new(),
            task_completed: false,
            calls: vec![grep_call("x", "/nonexistent")],
        });
        let (env, _dir) = test_env(planner);
        let idx = env.state.append_message(crate::state::Message::new("loop"));

        let err = run_loop(&env, idx, Mode::Ask, false).await.unwrap_err();
        assert!(matches!(err, LoopError::IterationLimit(_)));
    }

    #[tokio::test]
    async fn kill_flag_exits_gracefully() {
        let planner = ScriptedPlanner::looping(PlannerOutput {
            explanation: String::new(),
            task_completed: false,
            calls: vec![grep_call("x", "/nonexistent")],
        });
        let (env, _dir) = test_env(planner);
        env.kill.store(true, Ordering::SeqCst);
        let idx = env.state.append_message(crate::state::Message::new("halt"));

        let answer = run_loop(&env, idx, Mode::Ask, false).await.unwrap();
        assert!(answer.contains("stopped"));
    }

    #[tokio::test]
    async fn history_records_completed_tools() {
        let planner = ScriptedPlanner::with(vec![
            PlannerOutput {
                explanation: "looking around".into(),
                task_completed: false,
                calls: vec![ExecuteTool {
                    tool_name: "todo_write".into(),
                    tool_input: json!({"todos": [{"id": "1", "status": "pending", "content": "look"}]}),
                }],
            },
            PlannerOutput::completed("done"),
        ]);
        let (env, _dir) = test_env(planner);
        let idx = env.state.append_message(crate::state::Message::new("go"));

        run_loop(&env, idx, Mode::Ask, false).await.unwrap();

        let msg = env.state.message_snapshot(idx);
        assert_eq!(msg.tool_history.len(), 1);
        assert_eq!(msg.tool_history[0].tool_name, "todo_write");
        assert!(msg.updates.iter().any(|u| u.contains("looking around")));
    }

    #[tokio::test]
    async fn transport_failure_escalates_after_retries() {
        let planner = ScriptedPlanner::failing();
        let (env, _dir) = test_env(planner);
        let idx = env.state.append_message(crate::state::Message::new("x"));

        let err = run_loop(&env, idx, Mode::Ask, false).await.unwrap_err();
        match err {
            LoopError::Transport { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Transport, got {:?}", other),
        }
    }
}
