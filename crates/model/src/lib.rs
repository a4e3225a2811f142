//! # Waypoint Model
//!
//! Entity schema and validation for the Project → Epic → Story → Task
//! hierarchy.
//!
//! ## Layers
//!
//! ```text
//! JSON documents
//!     │
//!     ├──> Schema types (serde)
//!     │      └─> ProjectState / EpicState / StoryState / TaskState
//!     │
//!     ├──> Validator
//!     │      └─> ValidationReport (errors + warnings)
//!     │
//!     └──> Task-file reader (discriminated)
//!            └─> TaskDocument::{Task, LegacyTodos, Unrecognized}
//! ```
//!
//! This crate is synchronous and performs no I/O; persistence lives in
//! `waypoint-store`.

mod error;
mod schema;
mod task_file;
mod validate;

pub use error::{ModelError, Result};
pub use schema::{
    now_unix_ms, AcceptanceCriterion, EntityKind, EpicMetrics, EpicState, EpicsFile, Metadata,
    Priority, ProjectMetrics, ProjectState, StateCollection, Status, StoriesFile, StoriesMeta,
    StoryMetrics, StoryState, TaskNote, TaskState, TaskType, STATE_SCHEMA_VERSION,
};
pub use task_file::{LegacyTodo, TaskDocument, TaskItem};
pub use validate::{RuleKind, ValidationIssue, ValidationReport, Validator};
