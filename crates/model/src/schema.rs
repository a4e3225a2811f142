//! Persisted entity schema for the work hierarchy.
//!
//! Every entity carries a [`Metadata`] block with an immutable ID and
//! unix-millisecond timestamps. Collections key entities by ID; the key must
//! match `meta.id` (checked by the validator, never silently repaired).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Schema version stamped into freshly created documents.
pub const STATE_SCHEMA_VERSION: &str = "1.0.0";

/// Current wall-clock time as unix milliseconds.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle status shared by every entity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
    Cancelled,
}

impl Status {
    /// Statuses that count as unfinished work.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Todo | Status::InProgress | Status::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

/// Common bookkeeping block carried by every persisted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metadata {
    pub id: String,
    #[serde(default)]
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub updated_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub schema_version: String,
}

impl Metadata {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_unix_ms();
        Self {
            id: id.into(),
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
            created_by: None,
            updated_by: None,
            schema_version: STATE_SCHEMA_VERSION.to_string(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_unix_ms = now_unix_ms();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectMetrics {
    #[serde(default)]
    pub total_epics: u32,
    #[serde(default)]
    pub completed_epics: u32,
    #[serde(default)]
    pub progress_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EpicMetrics {
    #[serde(default)]
    pub total_stories: u32,
    #[serde(default)]
    pub completed_stories: u32,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoryMetrics {
    #[serde(default)]
    pub total_tasks: u32,
    #[serde(default)]
    pub completed_tasks: u32,
    #[serde(default)]
    pub progress_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectState {
    pub meta: Metadata,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metrics: ProjectMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EpicState {
    pub meta: Metadata,
    #[serde(default)]
    pub project_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    /// Sibling epic IDs this epic depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Sibling epic IDs blocked by this epic.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metrics: EpicMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoryState {
    pub meta: Metadata,
    #[serde(default)]
    pub epic_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub metrics: StoryMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Feature,
    Bug,
    Refactor,
    Test,
    Docs,
    Chore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskNote {
    #[serde(default)]
    pub at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskState {
    pub meta: Metadata,
    #[serde(default)]
    pub story_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<TaskNote>,
}

/// All entities of one project tree, keyed by ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateCollection {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub projects: HashMap<String, ProjectState>,
    #[serde(default)]
    pub epics: HashMap<String, EpicState>,
    #[serde(default)]
    pub stories: HashMap<String, StoryState>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskState>,
}

/// Envelope for `docs/1-project/epics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EpicsFile {
    #[serde(default)]
    pub epics: Vec<EpicState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoriesMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_story: Option<String>,
}

/// Envelope for `docs/2-current-epic/stories.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoriesFile {
    #[serde(default)]
    pub stories: Vec<StoryState>,
    #[serde(default)]
    pub meta: StoriesMeta,
}

/// Explicit tag callers attach to a document so structural checks never have
/// to guess the schema from the filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Epic,
    Story,
    Task,
    Collection,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Project => "project",
            EntityKind::Epic => "epic",
            EntityKind::Story => "story",
            EntityKind::Task => "task",
            EntityKind::Collection => "collection",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EntityKind {
    type Err = crate::error::ModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "project" => EntityKind::Project,
            "epic" => EntityKind::Epic,
            "story" => EntityKind::Story,
            "task" => EntityKind::Task,
            "collection" => EntityKind::Collection,
            other => {
                return Err(crate::error::ModelError::UnknownEntityKind(
                    other.to_string(),
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_snake_case_wire_format() {
        let json = serde_json::to_string(&Status::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
        let back: Status = serde_json::from_str("\"blocked\"").expect("deserialize");
        assert_eq!(back, Status::Blocked);
    }

    #[test]
    fn priority_uppercase_wire_format() {
        let json = serde_json::to_string(&Priority::P0).expect("serialize");
        assert_eq!(json, "\"P0\"");
    }

    #[test]
    fn task_state_round_trips_with_defaults() {
        let json = r#"{"meta":{"id":"task-1"},"title":"Wire up parser"}"#;
        let task: TaskState = serde_json::from_str(json).expect("deserialize");
        assert_eq!(task.meta.id, "task-1");
        assert_eq!(task.status, Status::Todo);
        assert_eq!(task.task_type, TaskType::Feature);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn entity_kind_parses_its_display_names() {
        for kind in [
            EntityKind::Project,
            EntityKind::Epic,
            EntityKind::Story,
            EntityKind::Task,
            EntityKind::Collection,
        ] {
            let parsed: EntityKind = kind.to_string().parse().expect("round trip");
            assert_eq!(parsed, kind);
        }
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn metadata_new_stamps_schema_version() {
        let meta = Metadata::new("epic-7");
        assert_eq!(meta.schema_version, STATE_SCHEMA_VERSION);
        assert!(meta.created_at_unix_ms > 0);
        assert_eq!(meta.created_at_unix_ms, meta.updated_at_unix_ms);
    }
}
