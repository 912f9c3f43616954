//! Process-wide shared state with partitioned locking.
//!
//! One `State` is constructed at startup and passed by `Arc`; it is never
//! replaced. Each field group has its own lock, taken in the fixed order
//! `exec → messages → message_queue → sub_agents → file_cache → stdin`,
//! and no lock is ever held across network or filesystem calls.

mod message;

pub use message::{ContextItem, Message, Mode, QueuedMessage, Todo, TodoStatus, ToolHistoryEntry};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CachedFileSummary, FileCache};
use crate::config::Config;

/// Lightweight registration of a live subagent in its parent's state.
#[derive(Debug, Clone)]
pub struct SubAgentHandle {
    pub id: Uuid,
    pub mode: Mode,
    kill: Arc<AtomicBool>,
}

impl SubAgentHandle {
    pub fn new(mode: Mode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            kill: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the subagent loop for graceful exit after the current tool.
    pub fn kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    /// The underlying flag, shared with the loop driver.
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        self.kill.clone()
    }
}

/// Snapshot of one message for state publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub body: String,
    pub answer_summary: Option<String>,
    pub todos: Vec<Todo>,
    pub tool_history: Vec<ToolHistoryEntry>,
    pub updates: Vec<String>,
}

/// Full state snapshot emitted through the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub is_executing: bool,
    pub agent_mode: Mode,
    pub queue_depth: usize,
    pub messages: Vec<MessageSnapshot>,
    pub cached_files: Vec<CachedFileSummary>,
}

/// Receives state snapshots whenever messages, todos, tool history, or
/// cache composition change. Topic/channel wiring is up to the consumer.
pub trait StatePublisher: Send + Sync {
    fn publish(&self, snapshot: StateSnapshot);
}

/// Publisher that drops every snapshot. Default for tests and headless use.
pub struct NoopPublisher;

impl StatePublisher for NoopPublisher {
    fn publish(&self, _snapshot: StateSnapshot) {}
}

/// Publisher fanning out over a tokio broadcast channel.
pub struct ChannelPublisher {
    tx: tokio::sync::broadcast::Sender<StateSnapshot>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<StateSnapshot>) {
        let (tx, rx) = tokio::sync::broadcast::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StatePublisher for ChannelPublisher {
    fn publish(&self, snapshot: StateSnapshot) {
        // Lagging or absent receivers are fine.
        let _ = self.tx.send(snapshot);
    }
}

struct ExecFlags {
    is_executing: bool,
    agent_mode: Mode,
}

/// Outcome of [`State::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Idle: the caller now owns execution and should start processing.
    Started,
    /// Busy: the message went to the back of the queue.
    Queued,
}

/// The shared state singleton. See the module docs for lock discipline.
pub struct State {
    exec: Mutex<ExecFlags>,
    messages: Mutex<Vec<Message>>,
    message_queue: Mutex<VecDeque<QueuedMessage>>,
    sub_agents: Mutex<Vec<SubAgentHandle>>,
    context: Mutex<Vec<ContextItem>>,
    custom_instructions: RwLock<String>,
    /// Serializes UI approval prompts from concurrent tools.
    stdin: tokio::sync::Mutex<()>,
    pub file_cache: FileCache,
    pub config: Config,
    pub workspace_root: PathBuf,
    publisher: Arc<dyn StatePublisher>,
}

impl State {
    pub fn new(config: Config, workspace_root: PathBuf, publisher: Arc<dyn StatePublisher>) -> Self {
        let custom_instructions = std::fs::read_to_string(workspace_root.join("ODIN.md"))
            .unwrap_or_default();
        let file_cache = FileCache::new(config.file_cache.clone());
        Self {
            exec: Mutex::new(ExecFlags {
                is_executing: false,
                agent_mode: Mode::Ask,
            }),
            messages: Mutex::new(Vec::new()),
            message_queue: Mutex::new(VecDeque::new()),
            sub_agents: Mutex::new(Vec::new()),
            context: Mutex::new(Vec::new()),
            custom_instructions: RwLock::new(custom_instructions),
            stdin: tokio::sync::Mutex::new(()),
            file_cache,
            config,
            workspace_root,
            publisher,
        }
    }

    // ── exec flags (state_mx) ──────────────────────────────────────────

    /// Atomically observe `is_executing` and, when idle, claim execution
    /// with the given mode. Returns whether the claim succeeded.
    pub fn try_begin_executing(&self, mode: Mode) -> bool {
        let mut exec = self.exec.lock().expect("state lock poisoned");
        if exec.is_executing {
            return false;
        }
        exec.is_executing = true;
        exec.agent_mode = mode;
        true
    }

    pub fn finish_executing(&self) {
        let mut exec = self.exec.lock().expect("state lock poisoned");
        exec.is_executing = false;
    }

    /// Admission control: claim execution when idle, otherwise queue.
    /// The check and the enqueue happen under the locks together so a
    /// finishing activation can never miss a just-queued message.
    pub fn admit(&self, body: String, mode: Mode) -> Admission {
        let mut exec = self.exec.lock().expect("state lock poisoned");
        if !exec.is_executing {
            exec.is_executing = true;
            exec.agent_mode = mode;
            return Admission::Started;
        }
        // Lock order: state_mx → message_queue_mx.
        let mut queue = self.message_queue.lock().expect("queue lock poisoned");
        queue.push_back(QueuedMessage {
            body,
            mode,
            timestamp: chrono::Utc::now(),
        });
        Admission::Queued
    }

    /// End-of-activation handoff: atomically pop the next queued message
    /// (staying claimed, with the mode rebound) or release execution.
    pub fn finish_or_claim_next(&self) -> Option<QueuedMessage> {
        let mut exec = self.exec.lock().expect("state lock poisoned");
        let mut queue = self.message_queue.lock().expect("queue lock poisoned");
        match queue.pop_front() {
            Some(next) => {
                exec.agent_mode = next.mode;
                Some(next)
            }
            None => {
                exec.is_executing = false;
                None
            }
        }
    }

    pub fn is_executing(&self) -> bool {
        self.exec.lock().expect("state lock poisoned").is_executing
    }

    pub fn agent_mode(&self) -> Mode {
        self.exec.lock().expect("state lock poisoned").agent_mode
    }

    // ── messages (messages_mx) ─────────────────────────────────────────

    /// Append a message, returning its index. Messages are never deleted.
    pub fn append_message(&self, message: Message) -> usize {
        let index = {
            let mut messages = self.messages.lock().expect("messages lock poisoned");
            messages.push(message);
            messages.len() - 1
        };
        self.publish();
        index
    }

    /// Mutate one message under `messages_mx`. Panics on a bad index;
    /// indices come only from `append_message`.
    pub fn with_message<R>(&self, index: usize, f: impl FnOnce(&mut Message) -> R) -> R {
        let result = {
            let mut messages = self.messages.lock().expect("messages lock poisoned");
            f(&mut messages[index])
        };
        self.publish();
        result
    }

    pub fn message_snapshot(&self, index: usize) -> Message {
        let messages = self.messages.lock().expect("messages lock poisoned");
        messages[index].clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().expect("messages lock poisoned").len()
    }

    // ── queue (message_queue_mx) ───────────────────────────────────────

    pub fn enqueue(&self, queued: QueuedMessage) {
        {
            let mut queue = self.message_queue.lock().expect("queue lock poisoned");
            queue.push_back(queued);
        }
        self.publish();
    }

    pub fn dequeue(&self) -> Option<QueuedMessage> {
        let head = {
            let mut queue = self.message_queue.lock().expect("queue lock poisoned");
            queue.pop_front()
        };
        if head.is_some() {
            self.publish();
        }
        head
    }

    pub fn queue_depth(&self) -> usize {
        self.message_queue.lock().expect("queue lock poisoned").len()
    }

    // ── subagents (sub_agents_mx) ──────────────────────────────────────

    pub fn register_sub_agent(&self, handle: SubAgentHandle) {
        let mut subs = self.sub_agents.lock().expect("sub_agents lock poisoned");
        subs.push(handle);
    }

    pub fn deregister_sub_agent(&self, id: Uuid) {
        let mut subs = self.sub_agents.lock().expect("sub_agents lock poisoned");
        subs.retain(|h| h.id != id);
    }

    pub fn sub_agent_handles(&self) -> Vec<SubAgentHandle> {
        self.sub_agents.lock().expect("sub_agents lock poisoned").clone()
    }

    // ── context & instructions ─────────────────────────────────────────

    pub fn push_context(&self, item: ContextItem) {
        self.context.lock().expect("context lock poisoned").push(item);
    }

    pub fn context_items(&self) -> Vec<ContextItem> {
        self.context.lock().expect("context lock poisoned").clone()
    }

    pub fn replace_context(&self, items: Vec<ContextItem>) {
        *self.context.lock().expect("context lock poisoned") = items;
    }

    pub fn custom_instructions(&self) -> String {
        self.custom_instructions
            .read()
            .expect("instructions lock poisoned")
            .clone()
    }

    /// Re-read `ODIN.md` after `InitTool` rewrites it.
    pub fn reload_instructions(&self) {
        let fresh = std::fs::read_to_string(self.workspace_root.join("ODIN.md"))
            .unwrap_or_default();
        *self
            .custom_instructions
            .write()
            .expect("instructions lock poisoned") = fresh;
    }

    // ── approval serialization (stdin_mx) ──────────────────────────────

    /// Guard held while a single approval prompt is in flight.
    pub async fn stdin_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.stdin.lock().await
    }

    // ── publishing ─────────────────────────────────────────────────────

    /// Assemble and emit a snapshot. Locks are taken in order and released
    /// before the publisher runs.
    pub fn publish(&self) {
        let (is_executing, agent_mode) = {
            let exec = self.exec.lock().expect("state lock poisoned");
            (exec.is_executing, exec.agent_mode)
        };
        let messages = {
            let messages = self.messages.lock().expect("messages lock poisoned");
            messages
                .iter()
                .map(|m| MessageSnapshot {
                    body: m.body.clone(),
                    answer_summary: m.answer_summary.clone(),
                    todos: m.todos.clone(),
                    tool_history: m.tool_history.clone(),
                    updates: m.updates.clone(),
                })
                .collect()
        };
        let queue_depth = self.queue_depth();
        let cached_files = self.file_cache.summary();

        self.publisher.publish(StateSnapshot {
            is_executing,
            agent_mode,
            queue_depth,
            messages,
            cached_files,
        });
    }

    /// Share the publisher with a child state.
    pub fn publisher_handle(&self) -> Arc<dyn StatePublisher> {
        self.publisher.clone()
    }

    /// Resolve a path against the workspace root; absolute paths pass through.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        }
    }
}
