//! Static registry of workflow actions and their prerequisites.

use serde::{Deserialize, Serialize};

use crate::analyzer::Position;

/// Conditions an action requires before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prerequisite {
    ProjectInitialized,
    HasEpics,
    NoActiveEpic,
    EpicInProgress,
    StoryInProgress,
    TaskInProgress,
    AllTasksComplete,
    AllStoriesComplete,
    EmptyDirectory,
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Prerequisite::ProjectInitialized => "project_initialized",
            Prerequisite::HasEpics => "has_epics",
            Prerequisite::NoActiveEpic => "no_active_epic",
            Prerequisite::EpicInProgress => "epic_in_progress",
            Prerequisite::StoryInProgress => "story_in_progress",
            Prerequisite::TaskInProgress => "task_in_progress",
            Prerequisite::AllTasksComplete => "all_tasks_complete",
            Prerequisite::AllStoriesComplete => "all_stories_complete",
            Prerequisite::EmptyDirectory => "empty_directory",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowAction {
    pub id: &'static str,
    pub title: &'static str,
    pub command: &'static str,
    pub prerequisites: &'static [Prerequisite],
    /// Positions where the action naturally belongs. Empty means every
    /// position (utilities).
    pub positions: &'static [Position],
}

use Position::*;
use Prerequisite::*;

static ACTIONS: &[WorkflowAction] = &[
    WorkflowAction {
        id: "init-project",
        title: "Initialize project",
        command: "init-project",
        prerequisites: &[EmptyDirectory],
        positions: &[NotInitialized],
    },
    WorkflowAction {
        id: "create-epic",
        title: "Create an epic",
        command: "create-epic",
        prerequisites: &[ProjectInitialized],
        positions: &[Project],
    },
    WorkflowAction {
        id: "list-epics",
        title: "List epics",
        command: "list-epics",
        prerequisites: &[ProjectInitialized],
        positions: &[Project, Epic],
    },
    WorkflowAction {
        id: "start-epic",
        title: "Start an epic",
        command: "start-epic",
        prerequisites: &[ProjectInitialized, HasEpics, NoActiveEpic],
        positions: &[Project],
    },
    WorkflowAction {
        id: "continue-epic",
        title: "Continue the current epic",
        command: "continue-epic",
        prerequisites: &[ProjectInitialized, EpicInProgress],
        positions: &[Epic],
    },
    WorkflowAction {
        id: "complete-epic",
        title: "Complete the current epic",
        command: "complete-epic",
        prerequisites: &[ProjectInitialized, EpicInProgress, AllStoriesComplete],
        positions: &[Epic],
    },
    WorkflowAction {
        id: "create-story",
        title: "Create a story",
        command: "create-story",
        prerequisites: &[ProjectInitialized, EpicInProgress],
        positions: &[Epic],
    },
    WorkflowAction {
        id: "start-story",
        title: "Start a story",
        command: "start-story",
        prerequisites: &[ProjectInitialized, EpicInProgress],
        positions: &[Epic],
    },
    WorkflowAction {
        id: "continue-story",
        title: "Continue the current story",
        command: "continue-story",
        prerequisites: &[ProjectInitialized, StoryInProgress],
        positions: &[Story],
    },
    WorkflowAction {
        id: "complete-story",
        title: "Complete the current story",
        command: "complete-story",
        prerequisites: &[ProjectInitialized, StoryInProgress, AllTasksComplete],
        positions: &[Story],
    },
    WorkflowAction {
        id: "create-task",
        title: "Create a task",
        command: "create-task",
        prerequisites: &[ProjectInitialized, StoryInProgress],
        positions: &[Story],
    },
    WorkflowAction {
        id: "start-task",
        title: "Start a task",
        command: "start-task",
        prerequisites: &[ProjectInitialized, StoryInProgress],
        positions: &[Story],
    },
    WorkflowAction {
        id: "continue-task",
        title: "Continue the current task",
        command: "continue-task",
        prerequisites: &[ProjectInitialized, TaskInProgress],
        positions: &[Task],
    },
    WorkflowAction {
        id: "complete-task",
        title: "Complete the current task",
        command: "complete-task",
        prerequisites: &[ProjectInitialized, TaskInProgress],
        positions: &[Task],
    },
    WorkflowAction {
        id: "status",
        title: "Show workflow status",
        command: "status",
        prerequisites: &[],
        positions: &[],
    },
    WorkflowAction {
        id: "help",
        title: "Show help",
        command: "help",
        prerequisites: &[],
        positions: &[],
    },
];

/// Lookup over the static action set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionRegistry;

impl ActionRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self, id: &str) -> Option<&'static WorkflowAction> {
        ACTIONS.iter().find(|a| a.id == id)
    }

    pub fn all(&self) -> &'static [WorkflowAction] {
        ACTIONS
    }

    /// Actions that naturally belong at `position`, utilities included.
    pub fn for_position(&self, position: Position) -> Vec<&'static WorkflowAction> {
        ACTIONS
            .iter()
            .filter(|a| a.positions.is_empty() || a.positions.contains(&position))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registry_has_the_full_action_set() {
        assert_eq!(ActionRegistry::new().all().len(), 16);
    }

    #[test]
    fn action_ids_are_unique() {
        let registry = ActionRegistry::new();
        let mut ids: Vec<&str> = registry.all().iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), registry.all().len());
    }

    #[test]
    fn utilities_apply_everywhere() {
        let registry = ActionRegistry::new();
        for position in [NotInitialized, Project, Epic, Story, Task] {
            let ids: Vec<&str> = registry
                .for_position(position)
                .iter()
                .map(|a| a.id)
                .collect();
            assert!(ids.contains(&"status"), "status missing at {position:?}");
            assert!(ids.contains(&"help"), "help missing at {position:?}");
        }
    }

    #[test]
    fn completing_requires_finished_children() {
        let registry = ActionRegistry::new();
        let complete_epic = registry.get("complete-epic").expect("registered");
        assert!(complete_epic.prerequisites.contains(&AllStoriesComplete));
        let complete_story = registry.get("complete-story").expect("registered");
        assert!(complete_story.prerequisites.contains(&AllTasksComplete));
    }
}
