//! Agents and the message queue executor.
//!
//! The main agent owns the shared state for the process lifetime and
//! serializes requests through admission control: one plan-act loop at a
//! time, strict FIFO, mode bound per message. Subagents run their own loop
//! against their own state with a weak back-reference to the parent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LoopError;
use crate::planner::driver::{self, DriverEnv};
use crate::planner::retry::RetryConfig;
use crate::state::{Admission, Message, Mode, State, SubAgentHandle};
use crate::tools::registry::{Services, ToolContext};
use crate::tools::{build_registry, ToolRegistry};

/// Answer emitted on the user-facing return channel when an activation
/// completes.
#[derive(Debug, Clone)]
pub struct AnswerEvent {
    pub body: String,
    pub mode: Mode,
    pub answer: String,
    pub is_error: bool,
}

/// Common surface of main and sub agents.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Mark the agent's loop for graceful exit after the current tool.
    fn kill(&self);

    /// Submit work. The main agent returns once the message is admitted;
    /// a subagent runs its loop to completion.
    async fn execute(&self, body: String, mode: Mode) -> anyhow::Result<()>;
}

/// The main agent. Owns the shared `State`, admits messages, and drives
/// them one at a time through the plan-act loop.
pub struct MainAgent {
    state: Arc<State>,
    services: Arc<Services>,
    registry: Arc<ToolRegistry>,
    answer_tx: mpsc::UnboundedSender<AnswerEvent>,
    kill: Arc<AtomicBool>,
}

impl MainAgent {
    pub fn new(
        state: Arc<State>,
        services: Arc<Services>,
    ) -> (Self, mpsc::UnboundedReceiver<AnswerEvent>) {
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();
        (
            Self {
                state,
                services,
                registry: Arc::new(build_registry()),
                answer_tx,
                kill: Arc::new(AtomicBool::new(false)),
            },
            answer_rx,
        )
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Admission control: start processing when idle, queue when busy.
    pub fn handle_incoming(&self, body: String, mode: Mode) {
        match self.state.admit(body.clone(), mode) {
            Admission::Started => {
                tracing::info!(mode = %mode, "starting message processing");
                let state = self.state.clone();
                let services = self.services.clone();
                let registry = self.registry.clone();
                let answer_tx = self.answer_tx.clone();
                let kill = self.kill.clone();
                tokio::spawn(async move {
                    process_messages(state, services, registry, answer_tx, kill, body, mode).await;
                });
            }
            Admission::Queued => {
                tracing::info!(mode = %mode, "executor busy, message queued");
            }
        }
    }
}

#[async_trait]
impl Agent for MainAgent {
    fn kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }

    async fn execute(&self, body: String, mode: Mode) -> anyhow::Result<()> {
        self.handle_incoming(body, mode);
        Ok(())
    }
}

/// Process the admitted message, then drain the queue. The caller has
/// already claimed execution via `State::admit`; the claim is either
/// handed to the next queued message or released atomically at the end of
/// each activation, so at most one activation ever runs.
async fn process_messages(
    state: Arc<State>,
    services: Arc<Services>,
    registry: Arc<ToolRegistry>,
    answer_tx: mpsc::UnboundedSender<AnswerEvent>,
    kill: Arc<AtomicBool>,
    body: String,
    mode: Mode,
) {
    let mut current = (body, mode);

    loop {
        let (body, mode) = current;
        let index = state.append_message(Message::new(body.clone()));

        let env = DriverEnv {
            state: state.clone(),
            services: services.clone(),
            registry: registry.clone(),
            parent: None,
            kill: kill.clone(),
            retry: RetryConfig::default(),
        };

        let (answer, is_error) = match driver::run_loop(&env, index, mode, false).await {
            Ok(answer) => (answer, false),
            Err(err) => {
                tracing::error!(error = %err, "plan-act loop failed");
                (format!("task failed: {}", err), true)
            }
        };

        // Cleared means set to empty, not nil.
        state.with_message(index, |m| {
            m.answer_summary = Some(answer.clone());
            m.updates = Vec::new();
        });

        let _ = answer_tx.send(AnswerEvent {
            body,
            mode,
            answer,
            is_error,
        });

        match state.finish_or_claim_next() {
            Some(next) => current = (next.body, next.mode),
            None => break,
        }
    }
}

/// A child agent: own state, own loop, weak link back to the parent.
pub struct SubAgent {
    state: Arc<State>,
    services: Arc<Services>,
    registry: Arc<ToolRegistry>,
    parent: Weak<State>,
    handle: SubAgentHandle,
    mode: Mode,
}

impl SubAgent {
    /// Create a subagent registered in the parent's state. The parent link
    /// is weak: the child never keeps the parent alive.
    pub fn spawn(parent: &Arc<State>, services: Arc<Services>, mode: Mode) -> Self {
        let handle = SubAgentHandle::new(mode);
        parent.register_sub_agent(handle.clone());

        let state = Arc::new(State::new(
            parent.config.clone(),
            parent.workspace_root.clone(),
            parent.publisher_handle(),
        ));

        Self {
            state,
            services,
            registry: Arc::new(build_registry()),
            parent: Arc::downgrade(parent),
            handle,
            mode,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.handle.id
    }

    /// Run one plan-act loop for `task` and deregister from the parent.
    pub async fn run(&self, task: &str) -> Result<String, LoopError> {
        let admission = self.state.admit(task.to_string(), self.mode);
        assert_eq!(admission, Admission::Started, "subagent state must start idle");

        let index = self.state.append_message(Message::new(task));
        let env = DriverEnv {
            state: self.state.clone(),
            services: self.services.clone(),
            registry: self.registry.clone(),
            parent: Some(self.parent.clone()),
            kill: self.handle.kill_flag(),
            retry: RetryConfig::default(),
        };

        let result = driver::run_loop(&env, index, self.mode, true).await;

        match &result {
            Ok(answer) => {
                self.state.with_message(index, |m| {
                    m.answer_summary = Some(answer.clone());
                    m.updates = Vec::new();
                });
            }
            Err(err) => {
                let diagnostic = format!("task failed: {}", err);
                self.state.with_message(index, |m| {
                    m.answer_summary = Some(diagnostic);
                    m.updates = Vec::new();
                });
            }
        }
        let _ = self.state.finish_or_claim_next();

        // Self-removal from the parent under sub_agents_mx.
        if let Some(parent) = self.parent.upgrade() {
            parent.deregister_sub_agent(self.handle.id);
        }

        result
    }
}

#[async_trait]
impl Agent for SubAgent {
    fn kill(&self) {
        self.handle.kill();
        if let Some(parent) = self.parent.upgrade() {
            parent.deregister_sub_agent(self.handle.id);
        }
    }

    async fn execute(&self, body: String, _mode: Mode) -> anyhow::Result<()> {
        self.run(&body).await.map(|_| ()).map_err(|e| anyhow::anyhow!(e))
    }
}

/// Spawn and run a subagent on behalf of the `agent` tool.
pub async fn run_sub_agent(
    ctx: &ToolContext,
    mode: Mode,
    task: &str,
) -> Result<String, LoopError> {
    let sub = SubAgent::spawn(&ctx.state, ctx.services.clone(), mode);
    sub.run(task).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ExecuteTool, PlannerOutput};
    use crate::test_support::{make_services, make_state, ScriptedPlanner};
    use serde_json::json;
    use std::time::Duration;

    async fn drain_one(rx: &mut mpsc::UnboundedReceiver<AnswerEvent>) -> AnswerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for answer")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn single_message_produces_answer() {
        let (state, _dir) = make_state();
        let services = make_services(ScriptedPlanner::with(vec![PlannerOutput::completed(
            "it prints hello",
        )]));
        let (agent, mut rx) = MainAgent::new(state.clone(), services);

        agent.handle_incoming("what does main.go do?".into(), Mode::Ask);
        let event = drain_one(&mut rx).await;

        assert_eq!(event.answer, "it prints hello");
        assert!(!event.is_error);
        assert!(!state.is_executing());
        let msg = state.message_snapshot(0);
        assert_eq!(msg.answer_summary.as_deref(), Some("it prints hello"));
        assert!(msg.updates.is_empty());
    }

    #[tokio::test]
    async fn rapid_submissions_run_fifo() {
        let (state, _dir) = make_state();
        // One completion per message; the scripted planner pops in order.
        let services = make_services(ScriptedPlanner::with(vec![
            PlannerOutput::completed("answer one"),
            PlannerOutput::completed("answer two"),
            PlannerOutput::completed("answer three"),
        ]));
        let (agent, mut rx) = MainAgent::new(state.clone(), services);

        agent.handle_incoming("first".into(), Mode::Ask);
        agent.handle_incoming("second".into(), Mode::Plan);
        agent.handle_incoming("third".into(), Mode::Ask);

        let first = drain_one(&mut rx).await;
        let second = drain_one(&mut rx).await;
        let third = drain_one(&mut rx).await;

        assert_eq!(first.body, "first");
        assert_eq!(second.body, "second");
        assert_eq!(third.body, "third");
        assert_eq!(second.mode, Mode::Plan);
        assert!(!state.is_executing());
        assert_eq!(state.queue_depth(), 0);
        assert_eq!(state.message_count(), 3);
    }

    #[tokio::test]
    async fn fatal_loop_error_still_drains_queue() {
        let (state, _dir) = make_state();
        // First message exhausts planner transport; second succeeds.
        let services = make_services(ScriptedPlanner::failing_then(vec![
            PlannerOutput::completed("recovered"),
        ]));
        let (agent, mut rx) = MainAgent::new(state.clone(), services);

        agent.handle_incoming("doomed".into(), Mode::Ask);
        agent.handle_incoming("fine".into(), Mode::Ask);

        let first = drain_one(&mut rx).await;
        assert!(first.is_error);
        assert!(first.answer.contains("task failed"));

        let second = drain_one(&mut rx).await;
        assert_eq!(second.answer, "recovered");
        assert!(!second.is_error);
    }

    #[tokio::test]
    async fn sub_agent_runs_and_deregisters() {
        let (state, _dir) = make_state();
        let services = make_services(ScriptedPlanner::with(vec![PlannerOutput::completed(
            "explored",
        )]));

        let sub = SubAgent::spawn(&state, services, Mode::Ask);
        assert_eq!(state.sub_agent_handles().len(), 1);

        let answer = sub.run("explore the repo").await.unwrap();
        assert_eq!(answer, "explored");
        assert!(state.sub_agent_handles().is_empty());
    }

    #[tokio::test]
    async fn killed_sub_agent_exits_gracefully() {
        let (state, _dir) = make_state();
        let services = make_services(ScriptedPlanner::looping(PlannerOutput {
            explanation: String::new(),
            task_completed: false,
            calls: vec![ExecuteTool {
                tool_name: "glob".into(),
                tool_input: json!({"pattern": "*.none"}),
            }],
        }));

        let sub = SubAgent::spawn(&state, services, Mode::Ask);
        sub.kill();
        let answer = sub.run("never finishes").await.unwrap();
        assert!(answer.contains("stopped"));
        assert!(state.sub_agent_handles().is_empty());
    }

    #[tokio::test]
    async fn sub_agent_does_not_keep_parent_alive() {
        let (state, _dir) = make_state();
        let services = make_services(ScriptedPlanner::empty());
        let sub = SubAgent::spawn(&state, services, Mode::Ask);

        let weak = Arc::downgrade(&state);
        drop(state);
        assert!(weak.upgrade().is_none(), "child must hold only a weak link");
        drop(sub);
    }
}
