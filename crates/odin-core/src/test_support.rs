//! Shared fixtures: a scripted planner and ready-made state/context builders.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::cache::sufficiency::ExactMatchValidator;
use crate::cache::FileCacheConfig;
use crate::config::Config;
use crate::planner::driver::DriverEnv;
use crate::planner::retry::RetryConfig;
use crate::planner::{Planner, PlannerError, PlannerInput, PlannerOutput, SmallModel};
use crate::state::{Message, Mode, NoopPublisher, State};
use crate::tools::registry::{Services, ToolContext};
use crate::tools::safeguard::{AllowAll, ApprovalGate, DenyAll};
use crate::tools::build_registry;

/// Planner stub that serves a fixed script of outputs, records every input
/// it sees, and can simulate transport failures.
pub(crate) struct ScriptedPlanner {
    script: Mutex<VecDeque<PlannerOutput>>,
    repeating: Option<PlannerOutput>,
    failures_remaining: Mutex<usize>,
    seen: Arc<Mutex<Vec<PlannerInput>>>,
}

impl ScriptedPlanner {
    /// Completes immediately on every call.
    pub fn empty() -> Self {
        Self::with(Vec::new())
    }

    /// Pops outputs in order; once exhausted, completes with "done".
    pub fn with(outputs: Vec<PlannerOutput>) -> Self {
        Self {
            script: Mutex::new(outputs.into()),
            repeating: None,
            failures_remaining: Mutex::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the same output forever. Never completes.
    pub fn looping(output: PlannerOutput) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeating: Some(output),
            failures_remaining: Mutex::new(0),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails every call with a retryable transport error.
    pub fn failing() -> Self {
        let planner = Self::with(Vec::new());
        *planner.failures_remaining.lock().unwrap() = usize::MAX;
        planner
    }

    /// Fails enough times to exhaust the default retry budget, then serves
    /// the script.
    pub fn failing_then(outputs: Vec<PlannerOutput>) -> Self {
        let planner = Self::with(outputs);
        *planner.failures_remaining.lock().unwrap() = RetryConfig::default().max_attempts;
        planner
    }

    /// Handle to the inputs recorded by `plan`. Grab before moving the
    /// planner into `Services`.
    pub fn seen_inputs(&self) -> Arc<Mutex<Vec<PlannerInput>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, input: &PlannerInput) -> Result<PlannerOutput, PlannerError> {
        self.seen.lock().unwrap().push(input.clone());

        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures = failures.saturating_sub(1);
                return Err(PlannerError::transport(
                    "simulated connection failure",
                    None,
                ));
            }
        }

        if let Some(output) = &self.repeating {
            return Ok(output.clone());
        }
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| PlannerOutput::completed("done")))
    }
}

/// Small model stub that echoes a digest of the prompt.
pub(crate) struct EchoModel;

#[async_trait]
impl SmallModel for EchoModel {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        Ok(format!("[condensed {} chars]", prompt.len()))
    }
}

fn test_config() -> Config {
    Config {
        allowed_commands: Vec::new(),
        forbidden_commands: vec!["rm -rf".to_string()],
        file_cache: FileCacheConfig {
            enable_auto_refresh: false,
            ..Default::default()
        },
        max_iterations: 8,
    }
}

pub(crate) fn make_state() -> (Arc<State>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let state = Arc::new(State::new(
        test_config(),
        dir.path().to_path_buf(),
        Arc::new(NoopPublisher),
    ));
    (state, dir)
}

pub(crate) fn make_services(planner: ScriptedPlanner) -> Arc<Services> {
    make_services_with_approval(planner, false)
}

fn make_services_with_approval(planner: ScriptedPlanner, approve: bool) -> Arc<Services> {
    let approval: Arc<dyn ApprovalGate> = if approve {
        Arc::new(AllowAll)
    } else {
        Arc::new(DenyAll)
    };
    Arc::new(Services {
        planner: Arc::new(planner),
        small_model: Arc::new(EchoModel),
        validator: Arc::new(ExactMatchValidator),
        approval,
    })
}

/// Context for exercising tools directly, with one message appended.
pub(crate) fn test_context(planner: ScriptedPlanner) -> (ToolContext, TempDir) {
    test_context_in_mode(planner, Mode::Edit)
}

pub(crate) fn test_context_in_mode(
    planner: ScriptedPlanner,
    mode: Mode,
) -> (ToolContext, TempDir) {
    build_context(planner, mode, false, false)
}

pub(crate) fn test_context_sub_agent(planner: ScriptedPlanner) -> (ToolContext, TempDir) {
    build_context(planner, Mode::Edit, true, false)
}

pub(crate) fn test_context_with_approval(
    planner: ScriptedPlanner,
    approve: bool,
) -> (ToolContext, TempDir) {
    build_context(planner, Mode::Edit, false, approve)
}

fn build_context(
    planner: ScriptedPlanner,
    mode: Mode,
    is_sub_agent: bool,
    approve: bool,
) -> (ToolContext, TempDir) {
    let (state, dir) = make_state();
    let index = state.append_message(Message::new("test message"));
    let services = make_services_with_approval(planner, approve);
    (
        ToolContext::new(state, services, mode, is_sub_agent, index),
        dir,
    )
}

/// A complete driver environment with fast retries.
pub(crate) fn test_env(planner: ScriptedPlanner) -> (DriverEnv, TempDir) {
    let (state, dir) = make_state();
    let services = make_services(planner);
    let env = DriverEnv {
        state,
        services,
        registry: Arc::new(build_registry()),
        parent: None,
        kill: Arc::new(AtomicBool::new(false)),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(4),
        },
    };
    (env, dir)
}
