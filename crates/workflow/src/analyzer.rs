//! Workflow position derivation.
//!
//! Position is never cached on disk; every analysis re-derives it from what
//! the docs tree actually contains. Blockers are computed independently and
//! never change the derived position.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_model::{
    EpicState, EpicsFile, Status, StoriesFile, StoryState, TaskDocument, TaskItem,
};
use waypoint_store::{paths, AtomicStore, StoreError};

use crate::error::{Result, WorkflowError};
use crate::external::ProjectProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    NotInitialized,
    Project,
    Epic,
    Story,
    Task,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Position::NotInitialized => "not_initialized",
            Position::Project => "project",
            Position::Epic => "epic",
            Position::Story => "story",
            Position::Task => "task",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionMetrics {
    pub epics_total: u32,
    pub epics_completed: u32,
    pub epic_progress_percent: f64,
    pub stories_total: u32,
    pub stories_completed: u32,
    pub story_progress_percent: f64,
    pub tasks_total: u32,
    pub tasks_completed: u32,
    pub task_progress_percent: f64,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    MissingDefinition,
    InconsistentState,
    MissingDependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSeverity {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub kind: BlockerKind,
    pub severity: BlockerSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowAnalysis {
    pub position: Position,
    pub current_epic: Option<EpicState>,
    pub current_story: Option<StoryState>,
    /// Items from current-task documents in active statuses.
    pub active_tasks: Vec<TaskItem>,
    pub metrics: CompletionMetrics,
    pub blockers: Vec<Blocker>,
    pub recommendations: Vec<String>,
}

/// Derives the workflow position from the docs tree under `root`.
pub struct WorkflowAnalyzer {
    root: PathBuf,
    store: Arc<AtomicStore>,
    probe: Arc<dyn ProjectProbe>,
}

impl WorkflowAnalyzer {
    pub fn new(root: impl Into<PathBuf>, store: Arc<AtomicStore>, probe: Arc<dyn ProjectProbe>) -> Self {
        Self {
            root: root.into(),
            store,
            probe,
        }
    }

    pub async fn analyze(&self) -> Result<WorkflowAnalysis> {
        let probe = self
            .probe
            .check(&self.root)
            .await
            .map_err(|e| WorkflowError::Probe(e.to_string()))?;
        if !probe.complete {
            let mut recommendations =
                vec!["initialize the project with init-project".to_string()];
            recommendations.extend(probe.issues);
            return Ok(WorkflowAnalysis {
                position: Position::NotInitialized,
                current_epic: None,
                current_story: None,
                active_tasks: Vec::new(),
                metrics: CompletionMetrics::default(),
                blockers: Vec::new(),
                recommendations,
            });
        }

        let epics = self
            .read_optional::<EpicsFile>(&self.root.join(paths::EPICS_FILE))
            .await?
            .unwrap_or_default();
        let current_epic = self
            .read_optional::<EpicState>(&self.root.join(paths::CURRENT_EPIC_FILE))
            .await?;
        let stories = self
            .read_optional::<StoriesFile>(&self.root.join(paths::STORIES_FILE))
            .await?
            .unwrap_or_default();
        let current_story = current_story(&stories);
        let task_items = self.read_task_items().await?;

        let metrics = completion_metrics(&epics, current_epic.as_ref(), &stories, &task_items);
        let active_tasks: Vec<TaskItem> = task_items
            .iter()
            .filter(|i| i.status.is_active())
            .cloned()
            .collect();

        let position = match (&current_epic, &current_story, active_tasks.is_empty()) {
            (None, _, _) => Position::Project,
            (Some(_), None, _) => Position::Epic,
            (Some(_), Some(_), true) => Position::Story,
            (Some(_), Some(_), false) => Position::Task,
        };

        let blockers = detect_blockers(current_epic.as_ref(), current_story.as_ref(), &stories, &task_items);
        let recommendations = recommend(position, &metrics, &blockers);

        Ok(WorkflowAnalysis {
            position,
            current_epic,
            current_story,
            active_tasks,
            metrics,
            blockers,
            recommendations,
        })
    }

    /// Action IDs that make sense at a given position.
    pub fn capabilities(position: Position) -> Vec<&'static str> {
        match position {
            Position::NotInitialized => vec!["init-project", "status", "help"],
            Position::Project => vec![
                "create-epic",
                "list-epics",
                "start-epic",
                "status",
                "help",
            ],
            Position::Epic => vec![
                "create-story",
                "start-story",
                "continue-epic",
                "complete-epic",
                "list-epics",
                "status",
                "help",
            ],
            Position::Story => vec![
                "create-task",
                "start-task",
                "continue-story",
                "complete-story",
                "status",
                "help",
            ],
            Position::Task => vec!["continue-task", "complete-task", "status", "help"],
        }
    }

    async fn read_optional<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.store.read_json::<T>(path).await {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All task items from `docs/3-current-task/*.json`, both schemas.
    /// Malformed documents are skipped; the analyzer must not fail because
    /// one file is bad.
    async fn read_task_items(&self) -> Result<Vec<TaskItem>> {
        let dir = self.root.join(paths::TASK_DIR);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorkflowError::Store(e.into())),
        };

        let mut items = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(StoreError::from)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json")
                || name == paths::CURRENT_TASK_POINTER
                || name.starts_with('.')
                || name.contains(".backup.")
                || name.contains(".tx_backup.")
            {
                continue;
            }
            let bytes = self.store.read_bytes(&path).await?;
            match TaskDocument::parse(&bytes) {
                Ok(TaskDocument::Unrecognized) => {
                    log::debug!("skipping unrecognized task document {}", path.display());
                }
                Ok(doc) => items.extend(doc.items()),
                Err(e) => {
                    log::warn!("skipping malformed task document {}: {e}", path.display());
                }
            }
        }
        Ok(items)
    }
}

fn current_story(stories: &StoriesFile) -> Option<StoryState> {
    if let Some(id) = &stories.meta.current_story {
        if let Some(story) = stories.stories.iter().find(|s| &s.meta.id == id) {
            return Some(story.clone());
        }
    }
    stories
        .stories
        .iter()
        .find(|s| s.status == Status::InProgress)
        .cloned()
}

fn completion_metrics(
    epics: &EpicsFile,
    current_epic: Option<&EpicState>,
    stories: &StoriesFile,
    task_items: &[TaskItem],
) -> CompletionMetrics {
    let epics_total = epics.epics.len() as u32;
    let epics_completed = epics
        .epics
        .iter()
        .filter(|e| e.status == Status::Done)
        .count() as u32;
    let stories_total = stories.stories.len() as u32;
    let stories_completed = stories
        .stories
        .iter()
        .filter(|s| s.status == Status::Done)
        .count() as u32;
    let tasks_total = task_items.len() as u32;
    let tasks_completed = task_items
        .iter()
        .filter(|t| t.status == Status::Done)
        .count() as u32;

    CompletionMetrics {
        epics_total,
        epics_completed,
        epic_progress_percent: ratio(epics_completed, epics_total),
        stories_total,
        stories_completed,
        story_progress_percent: ratio(stories_completed, stories_total),
        tasks_total,
        tasks_completed,
        task_progress_percent: ratio(tasks_completed, tasks_total),
        estimated_hours: current_epic.and_then(|e| e.estimated_hours),
        actual_hours: current_epic.and_then(|e| e.actual_hours),
    }
}

/// Zero denominator yields 0.0, never NaN.
fn ratio(completed: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(completed) / f64::from(total) * 100.0
    }
}

fn detect_blockers(
    current_epic: Option<&EpicState>,
    current_story: Option<&StoryState>,
    stories: &StoriesFile,
    task_items: &[TaskItem],
) -> Vec<Blocker> {
    let mut blockers = Vec::new();

    if let Some(epic) = current_epic {
        if stories.stories.is_empty() {
            blockers.push(Blocker {
                kind: BlockerKind::MissingDefinition,
                severity: BlockerSeverity::High,
                message: format!("epic '{}' has no stories defined", epic.title),
                entity_id: Some(epic.meta.id.clone()),
            });
        }
        let child_work_active = stories.stories.iter().any(|s| s.status.is_active())
            || task_items.iter().any(|t| t.status.is_active());
        if epic.status == Status::Done && child_work_active {
            blockers.push(Blocker {
                kind: BlockerKind::InconsistentState,
                severity: BlockerSeverity::Critical,
                message: format!(
                    "epic '{}' is marked done but stories or tasks are still active",
                    epic.title
                ),
                entity_id: Some(epic.meta.id.clone()),
            });
        }
    }

    if let Some(story) = current_story {
        if task_items.is_empty() {
            blockers.push(Blocker {
                kind: BlockerKind::MissingDefinition,
                severity: BlockerSeverity::Medium,
                message: format!("story '{}' has no tasks defined", story.title),
                entity_id: Some(story.meta.id.clone()),
            });
        }
    }

    for item in task_items.iter().filter(|t| t.status == Status::Blocked) {
        blockers.push(Blocker {
            kind: BlockerKind::MissingDependency,
            severity: BlockerSeverity::High,
            message: format!("task '{}' is blocked", item.title),
            entity_id: Some(item.id.clone()),
        });
    }

    blockers
}

fn recommend(position: Position, metrics: &CompletionMetrics, blockers: &[Blocker]) -> Vec<String> {
    let mut out = Vec::new();
    match position {
        Position::NotInitialized => {
            out.push("initialize the project with init-project".to_string());
        }
        Position::Project => {
            if metrics.epics_total == 0 {
                out.push("create your first epic with create-epic".to_string());
            } else {
                out.push("start an epic with start-epic".to_string());
            }
        }
        Position::Epic => {
            if metrics.stories_total == 0 {
                out.push("define stories for the current epic with create-story".to_string());
            } else {
                out.push("start a story with start-story".to_string());
            }
        }
        Position::Story => {
            if metrics.tasks_total == 0 {
                out.push("break the story into tasks with create-task".to_string());
            } else {
                out.push("all tasks are finished; complete the story".to_string());
            }
        }
        Position::Task => {
            out.push("continue the active task with continue-task".to_string());
        }
    }
    if metrics.tasks_total > 0 && metrics.task_progress_percent >= 80.0 {
        out.push("story is nearly complete; review acceptance criteria".to_string());
    }
    if !blockers.is_empty() {
        out.push("resolve active blockers before completing work".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use waypoint_model::{Metadata, StoriesMeta};

    fn story(id: &str, status: Status) -> StoryState {
        StoryState {
            meta: Metadata::new(id),
            epic_id: "epic-1".into(),
            title: format!("story {id}"),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn zero_denominators_never_produce_nan() {
        let metrics = completion_metrics(
            &EpicsFile::default(),
            None,
            &StoriesFile::default(),
            &[],
        );
        assert_eq!(metrics.epic_progress_percent, 0.0);
        assert_eq!(metrics.story_progress_percent, 0.0);
        assert_eq!(metrics.task_progress_percent, 0.0);
    }

    #[test]
    fn current_story_prefers_the_pointer_over_status() {
        let file = StoriesFile {
            stories: vec![story("s1", Status::InProgress), story("s2", Status::Todo)],
            meta: StoriesMeta {
                current_story: Some("s2".into()),
            },
        };
        let current = current_story(&file).expect("some");
        assert_eq!(current.meta.id, "s2");
    }

    #[test]
    fn dangling_pointer_falls_back_to_in_progress() {
        let file = StoriesFile {
            stories: vec![story("s1", Status::InProgress)],
            meta: StoriesMeta {
                current_story: Some("gone".into()),
            },
        };
        let current = current_story(&file).expect("some");
        assert_eq!(current.meta.id, "s1");
    }

    #[test]
    fn done_epic_with_active_work_is_a_critical_blocker() {
        let epic = EpicState {
            meta: Metadata::new("epic-1"),
            project_id: "p".into(),
            title: "Auth".into(),
            status: Status::Done,
            ..Default::default()
        };
        let stories = StoriesFile {
            stories: vec![story("s1", Status::InProgress)],
            meta: StoriesMeta::default(),
        };
        let blockers = detect_blockers(Some(&epic), None, &stories, &[]);
        assert!(blockers
            .iter()
            .any(|b| b.kind == BlockerKind::InconsistentState
                && b.severity == BlockerSeverity::Critical));
    }
}
