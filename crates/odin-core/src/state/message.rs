//! Message, queue, and todo domain types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Authorization context for one message. Binds the tool catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Ask,
    Plan,
    Edit,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Ask => write!(f, "ask"),
            Mode::Plan => write!(f, "plan"),
            Mode::Edit => write!(f, "edit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// One todo item. Ids are strings on the wire, integers internally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    #[serde(with = "decimal_string")]
    pub id: u64,
    pub status: TodoStatus,
    pub content: String,
}

/// Serialize `u64` todo ids as decimal strings, accept either shape on input.
mod decimal_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(|_| {
                de::Error::invalid_value(de::Unexpected::Str(&s), &"a decimal integer string")
            }),
        }
    }
}

/// Record of one completed tool call within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub tool_name: String,
    pub affected_files: Vec<PathBuf>,
    pub description: String,
}

/// A user request plus everything accumulated while processing it.
///
/// The body is immutable; the remaining fields are mutated only by the
/// executor that owns the message for the duration of its plan-act loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    pub answer_summary: Option<String>,
    pub todos: Vec<Todo>,
    pub tool_history: Vec<ToolHistoryEntry>,
    /// Transient progress lines; cleared (set to empty) on completion.
    pub updates: Vec<String>,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            answer_summary: None,
            todos: Vec::new(),
            tool_history: Vec::new(),
            updates: Vec::new(),
        }
    }

    /// Replace the todo list, holding the message invariants:
    /// unique ids, at most one `in_progress`, non-empty content, and no
    /// completed todo reverting to an earlier status.
    pub fn apply_todos(&mut self, todos: Vec<Todo>) -> Result<(), ToolError> {
        let mut seen = std::collections::HashSet::new();
        let mut in_progress = 0usize;
        for todo in &todos {
            if !seen.insert(todo.id) {
                return Err(ToolError::Validation(format!("duplicate todo id {}", todo.id)));
            }
            if todo.content.trim().is_empty() {
                return Err(ToolError::Validation(format!(
                    "todo {} has empty content",
                    todo.id
                )));
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
        // A completed todo must survive every rewrite: still present, still
        // completed. Dropping its id would erase the record just as surely
        // as flipping its status.
        for old in &self.todos {
            if old.status != TodoStatus::Completed {
                continue;
            }
            match todos.iter().find(|t| t.id == old.id) {
                Some(new) if new.status == TodoStatus::Completed => {}
                Some(_) => {
                    return Err(ToolError::Validation(format!(
                        "todo {} is completed and cannot revert",
                        old.id
                    )));
                }
                None => {
                    return Err(ToolError::Validation(format!(
                        "todo {} is completed and cannot be dropped",
                        old.id
                    )));
                }
            }
        }
        self.todos = todos;
        Ok(())
    }
}

/// A message waiting its turn behind the running activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub body: String,
    pub mode: Mode,
    pub timestamp: DateTime<Utc>,
}

/// Retrieved context surfaced to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_command: Option<String>,
}
