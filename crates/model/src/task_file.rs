//! Discriminated reader for current-task documents.
//!
//! Two on-disk schemas exist side by side: full [`TaskState`] documents and a
//! legacy `{"todos": [...]}` checklist format. The reader inspects the
//! document shape and returns an explicit tag; it never merges the two or
//! guesses field-by-field.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{Priority, Status, TaskState};

/// One row of the legacy checklist format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LegacyTodo {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct LegacyTodoFile {
    #[serde(default)]
    todos: Vec<LegacyTodo>,
}

/// Normalized view over either schema, for callers that only need
/// id/title/status.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub priority: Priority,
}

/// Outcome of reading a current-task document.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDocument {
    Task(TaskState),
    LegacyTodos(Vec<LegacyTodo>),
    /// Valid JSON, but matches neither schema. Callers decide whether this is
    /// an error or an ignorable file.
    Unrecognized,
}

impl TaskDocument {
    /// Parse a current-task document. Returns `Err` only for malformed JSON;
    /// shape mismatches come back as [`TaskDocument::Unrecognized`].
    pub fn parse(bytes: &[u8]) -> Result<TaskDocument> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let Some(obj) = value.as_object() else {
            return Ok(TaskDocument::Unrecognized);
        };

        if obj.get("todos").map(|t| t.is_array()).unwrap_or(false) {
            let file: LegacyTodoFile = serde_json::from_value(value)?;
            return Ok(TaskDocument::LegacyTodos(file.todos));
        }
        if obj.contains_key("meta") && obj.contains_key("title") {
            match serde_json::from_value::<TaskState>(value) {
                Ok(task) => return Ok(TaskDocument::Task(task)),
                Err(_) => return Ok(TaskDocument::Unrecognized),
            }
        }
        Ok(TaskDocument::Unrecognized)
    }

    /// Every item the document holds, normalized across both schemas.
    pub fn items(&self) -> Vec<TaskItem> {
        match self {
            TaskDocument::Task(task) => vec![TaskItem {
                id: task.meta.id.clone(),
                title: task.title.clone(),
                status: task.status,
                priority: task.priority,
            }],
            TaskDocument::LegacyTodos(todos) => todos
                .iter()
                .map(|t| TaskItem {
                    id: t.id.clone(),
                    title: t.title.clone(),
                    status: t.status,
                    priority: t.priority,
                })
                .collect(),
            TaskDocument::Unrecognized => Vec::new(),
        }
    }

    /// Items in active statuses (todo, in_progress, blocked).
    pub fn active_items(&self) -> Vec<TaskItem> {
        let mut items = self.items();
        items.retain(|i| i.status.is_active());
        items
    }
}
