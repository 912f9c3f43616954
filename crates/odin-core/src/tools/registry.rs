//! Tool registry: the pre-hook/execute/post-hook contract, bounded parallel
//! dispatch, and same-target collision serialization.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::ToolError;
use crate::planner::{ExecuteTool, Planner, SmallModel, ToolDescriptor};
use crate::cache::sufficiency::SufficiencyValidator;
use crate::state::{Mode, State};
use crate::tools::safeguard::ApprovalGate;

/// Default tool execution timeout (2 minutes).
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Worker-pool bound for one batch of tool calls.
const MAX_CONCURRENT_TOOLS: usize = 8;

/// Final product of one tool call: structured data plus a one-line
/// human-readable description for tool history and progress updates.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub data: Value,
    pub description: String,
}

impl ToolResponse {
    pub fn new(data: Value, description: impl Into<String>) -> Self {
        Self {
            data,
            description: description.into(),
        }
    }
}

/// External collaborators tools reach through.
pub struct Services {
    pub planner: Arc<dyn Planner>,
    pub small_model: Arc<dyn SmallModel>,
    pub validator: Arc<dyn SufficiencyValidator>,
    pub approval: Arc<dyn ApprovalGate>,
}

/// Per-activation execution context handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub state: Arc<State>,
    pub services: Arc<Services>,
    pub mode: Mode,
    pub is_sub_agent: bool,
    /// Index of the message this activation owns.
    pub message_index: usize,
    pub timeout: Option<Duration>,
    /// Paths/commands already approved during this activation.
    approvals: Arc<Mutex<HashSet<String>>>,
}

impl ToolContext {
    pub fn new(
        state: Arc<State>,
        services: Arc<Services>,
        mode: Mode,
        is_sub_agent: bool,
        message_index: usize,
    ) -> Self {
        Self {
            state,
            services,
            mode,
            is_sub_agent,
            message_index,
            timeout: None,
            approvals: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resolve a path against the workspace root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.state.resolve_path(path)
    }

    pub fn remember_approval(&self, key: &str) {
        self.approvals
            .lock()
            .expect("approvals lock poisoned")
            .insert(key.to_string());
    }

    pub fn is_approved(&self, key: &str) -> bool {
        self.approvals
            .lock()
            .expect("approvals lock poisoned")
            .contains(key)
    }
}

/// Trait every tool implements. The runtime calls `pre_hook`, `execute`,
/// and `post_hook` in order, short-circuiting on the first failure.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema (draft-07) for the input; `additionalProperties: false`.
    fn input_schema(&self) -> Value;

    /// Whether this call mutates the filesystem. Used for collision
    /// serialization; may depend on the input.
    fn is_mutating(&self, _input: &Value) -> bool {
        false
    }

    /// Paths this call touches. Default: `file_path` / `path` arguments.
    fn affected_paths(&self, input: &Value, ctx: &ToolContext) -> Vec<PathBuf> {
        ["file_path", "path"]
            .iter()
            .filter_map(|key| input.get(*key).and_then(|v| v.as_str()))
            .map(|p| ctx.resolve_path(p))
            .collect()
    }

    /// Validate and normalize the input. The returned value is what
    /// `execute` receives.
    async fn pre_hook(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(input)
    }

    /// Perform the work, returning the raw result.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    /// Shape the raw result into a `ToolResponse` and apply side effects
    /// (cache updates and the like).
    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        Ok(ToolResponse::new(raw, format!("{} finished", self.name())))
    }
}

/// Parse tool input into a typed struct, mapping failures onto the
/// validation error.
pub fn parse_params<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ToolError> {
    serde_json::from_value(input).map_err(|e| ToolError::Validation(format!("invalid parameters: {}", e)))
}

/// Completed call as the driver records it.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub ok: bool,
    /// Response data on success, error envelope on failure.
    pub payload: Value,
    pub description: String,
    pub affected_files: Vec<PathBuf>,
    /// Monotonic finish order within the batch. History is appended in this
    /// order, which may differ from issue order for parallel calls.
    pub completion_rank: u64,
}

impl ToolOutcome {
    fn from_error(tool_name: &str, err: &ToolError, affected_files: Vec<PathBuf>) -> Self {
        let mut envelope = json!({
            "ok": false,
            "error": { "code": err.code(), "message": err.to_string() },
        });
        if let ToolError::CacheInsufficient { suggested_ranges, .. } = err {
            envelope["error"]["suggested_line_ranges"] =
                serde_json::to_value(suggested_ranges).unwrap_or(Value::Null);
        }
        Self {
            tool_name: tool_name.to_string(),
            ok: false,
            payload: envelope,
            description: format!("{} failed: {}", tool_name, err),
            affected_files,
            completion_rank: 0,
        }
    }
}

/// Registry of available tools with a bounded worker pool.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
    concurrency: Arc<Semaphore>,
    completion_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_TOOLS)),
            completion_counter: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors for the named catalog, in catalog order. Unknown names
    /// are skipped.
    pub fn descriptors(&self, catalog: &[&str]) -> Vec<ToolDescriptor> {
        catalog
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Run one call through the full pre/execute/post contract.
    pub async fn execute_one(&self, call: &ExecuteTool, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(&call.tool_name) else {
            return ToolOutcome::from_error(
                &call.tool_name,
                &ToolError::Validation(format!("unknown tool '{}'", call.tool_name)),
                Vec::new(),
            );
        };

        let affected = tool.affected_paths(&call.tool_input, ctx);
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        let result = self
            .run_hooks(tool.as_ref(), call.tool_input.clone(), ctx, timeout)
            .await;
        let duration = start.elapsed();

        let rank = self
            .completion_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match result {
            Ok(response) => {
                tracing::info!(
                    tool = %call.tool_name,
                    duration_ms = duration.as_millis() as u64,
                    "tool completed"
                );
                ToolOutcome {
                    tool_name: call.tool_name.clone(),
                    ok: true,
                    payload: json!({ "ok": true, "data": response.data }),
                    description: response.description,
                    affected_files: affected,
                    completion_rank: rank,
                }
            }
            Err(err) => {
                tracing::warn!(
                    tool = %call.tool_name,
                    duration_ms = duration.as_millis() as u64,
                    error = %err,
                    "tool failed"
                );
                let mut outcome = ToolOutcome::from_error(&call.tool_name, &err, affected);
                outcome.completion_rank = rank;
                outcome
            }
        }
    }

    async fn run_hooks(
        &self,
        tool: &dyn Tool,
        input: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<ToolResponse, ToolError> {
        let phr = tool.pre_hook(input, ctx).await?;
        let raw = match tokio::time::timeout(timeout, tool.execute(phr, ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: tool.name().to_string(),
                    secs: timeout.as_secs(),
                })
            }
        };
        tool.post_hook(raw, ctx).await
    }

    /// Execute a batch. Independent calls run in parallel under the worker
    /// pool; calls whose target paths collide with a mutating call are
    /// serialized in input order. Results come back in input order.
    pub async fn execute_batch(&self, calls: &[ExecuteTool], ctx: &ToolContext) -> Vec<ToolOutcome> {
        if calls.len() == 1 {
            return vec![self.execute_one(&calls[0], ctx).await];
        }

        let groups = self.collision_groups(calls, ctx);

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let ctx = ctx.clone();
            let calls: Vec<ExecuteTool> = group.iter().map(|&i| calls[i].clone()).collect();
            let registry = self.clone_shallow();
            let permit_pool = self.concurrency.clone();
            handles.push((
                group,
                tokio::spawn(async move {
                    let mut outcomes = Vec::with_capacity(calls.len());
                    for call in &calls {
                        let _permit = permit_pool.acquire().await.expect("semaphore closed");
                        outcomes.push(registry.execute_one(call, &ctx).await);
                    }
                    outcomes
                }),
            ));
        }

        let mut ordered: Vec<Option<ToolOutcome>> = (0..calls.len()).map(|_| None).collect();
        for (group, handle) in handles {
            match handle.await {
                Ok(outcomes) => {
                    for (slot, outcome) in group.into_iter().zip(outcomes) {
                        ordered[slot] = Some(outcome);
                    }
                }
                Err(join_err) => {
                    for slot in group {
                        ordered[slot] = Some(ToolOutcome::from_error(
                            &calls[slot].tool_name,
                            &ToolError::Other(anyhow::anyhow!("tool task panicked: {}", join_err)),
                            Vec::new(),
                        ));
                    }
                }
            }
        }

        ordered.into_iter().map(|o| o.expect("slot filled")).collect()
    }

    /// Partition call indices into groups that must run sequentially.
    /// Two calls share a group when at least one of them is mutating and
    /// their target paths intersect. Groups preserve input order.
    fn collision_groups(&self, calls: &[ExecuteTool], ctx: &ToolContext) -> Vec<Vec<usize>> {
        let meta: Vec<(Vec<PathBuf>, bool)> = calls
            .iter()
            .map(|call| match self.get(&call.tool_name) {
                Some(tool) => (
                    tool.affected_paths(&call.tool_input, ctx),
                    tool.is_mutating(&call.tool_input),
                ),
                None => (Vec::new(), false),
            })
            .collect();

        // Union-find over indices.
        let mut parent: Vec<usize> = (0..calls.len()).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }

        for i in 0..calls.len() {
            for j in (i + 1)..calls.len() {
                let conflict = (meta[i].1 || meta[j].1)
                    && meta[i].0.iter().any(|p| meta[j].0.contains(p));
                if conflict {
                    let ri = find(&mut parent, i);
                    let rj = find(&mut parent, j);
                    if ri != rj {
                        parent[rj] = ri;
                    }
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..calls.len() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }
        let mut out: Vec<Vec<usize>> = groups.into_values().collect();
        out.sort_by_key(|g| g[0]);
        out
    }

    /// Cheap handle for spawned tasks: tools are shared behind `Arc`.
    fn clone_shallow(&self) -> Self {
        Self {
            tools: self.tools.clone(),
            default_timeout: self.default_timeout,
            concurrency: self.concurrency.clone(),
            completion_counter: self.completion_counter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, ScriptedPlanner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepTool {
        name: String,
        mutating: bool,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "additionalProperties": false})
        }
        fn is_mutating(&self, _input: &Value) -> bool {
            self.mutating
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(input)
        }
    }

    fn sleep_tool(name: &str, mutating: bool, active: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Arc<dyn Tool> {
        Arc::new(SleepTool {
            name: name.to_string(),
            mutating,
            active: active.clone(),
            max_active: max.clone(),
        })
    }

    fn call(name: &str, input: Value) -> ExecuteTool {
        ExecuteTool {
            tool_name: name.to_string(),
            tool_input: input,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_error() {
        let registry = ToolRegistry::new();
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let outcome = registry
            .execute_one(&call("nope", json!({})), &ctx)
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.payload["error"]["code"], "invalid_parameters");
    }

    #[tokio::test]
    async fn independent_calls_run_in_parallel() {
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(sleep_tool("reader", false, &active, &max));

        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let calls = vec![
            call("reader", json!({"path": "/a"})),
            call("reader", json!({"path": "/b"})),
        ];
        let outcomes = registry.execute_batch(&calls, &ctx).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.ok));
        assert_eq!(max.load(Ordering::SeqCst), 2, "reads should overlap");
    }

    #[tokio::test]
    async fn same_target_mutation_serializes() {
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(sleep_tool("reader", false, &active, &max));
        registry.register(sleep_tool("writer", true, &active, &max));

        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let calls = vec![
            call("reader", json!({"file_path": "/ws/auth.go"})),
            call("writer", json!({"file_path": "/ws/auth.go"})),
        ];
        let outcomes = registry.execute_batch(&calls, &ctx).await;
        assert!(outcomes.iter().all(|o| o.ok));
        assert_eq!(max.load(Ordering::SeqCst), 1, "colliding calls must not overlap");
    }

    #[tokio::test]
    async fn results_return_in_input_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(sleep_tool("reader", false, &active, &max));

        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let calls: Vec<ExecuteTool> = (0..4)
            .map(|i| call("reader", json!({"path": format!("/f{}", i), "idx": i})))
            .collect();
        let outcomes = registry.execute_batch(&calls, &ctx).await;
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.payload["data"]["idx"], i as i64);
        }
    }

    struct FailingPre;

    #[async_trait]
    impl Tool for FailingPre {
        fn name(&self) -> &str {
            "failing_pre"
        }
        fn description(&self) -> &str {
            "always rejects"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "additionalProperties": false})
        }
        async fn pre_hook(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Err(ToolError::Validation("bad input".into()))
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            panic!("execute must not run after pre_hook failure");
        }
    }

    #[tokio::test]
    async fn pre_hook_failure_short_circuits() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingPre));
        let (ctx, _dir) = test_context(ScriptedPlanner::empty());
        let outcome = registry
            .execute_one(&call("failing_pre", json!({})), &ctx)
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.payload["error"]["code"], "invalid_parameters");
    }
}
