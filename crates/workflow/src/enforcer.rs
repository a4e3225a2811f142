//! Action and transition validation.
//!
//! Validation is advisory with teeth: every unmet prerequisite, state clash,
//! and active blocker becomes a violation, and the override machinery decides
//! whether a human may push through anyway. Critical violations can never be
//! overridden.

use crate::actions::{ActionRegistry, Prerequisite, WorkflowAction};
use crate::analyzer::{BlockerKind, Position, WorkflowAnalysis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    UnknownAction,
    MissingPrerequisite,
    IncompatibleState,
    ActiveBlocker,
    CircularDependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub message: String,
    pub prerequisite: Option<Prerequisite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OverrideRisk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionValidation {
    pub action_id: String,
    pub is_valid: bool,
    pub violations: Vec<Violation>,
    pub suggestions: Vec<String>,
    pub warnings: Vec<String>,
    pub can_override: bool,
    pub override_risk: OverrideRisk,
}

/// Actions where an override itself is dangerous, regardless of violation
/// count.
const HIGH_RISK_ACTIONS: &[&str] = &["init-project", "complete-epic", "complete-story"];

/// Prerequisite, state, and blocker checks over a [`WorkflowAnalysis`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyEnforcer {
    registry: ActionRegistry,
}

impl DependencyEnforcer {
    pub fn new() -> Self {
        Self {
            registry: ActionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn validate_action(
        &self,
        analysis: &WorkflowAnalysis,
        action_id: &str,
        allow_override: bool,
    ) -> ActionValidation {
        let Some(action) = self.registry.get(action_id) else {
            return ActionValidation {
                action_id: action_id.to_string(),
                is_valid: false,
                violations: vec![Violation {
                    kind: ViolationKind::UnknownAction,
                    severity: ViolationSeverity::High,
                    message: format!("'{action_id}' is not a known workflow action"),
                    prerequisite: None,
                }],
                suggestions: vec!["run help to list available actions".to_string()],
                warnings: Vec::new(),
                can_override: false,
                override_risk: OverrideRisk::High,
            };
        };

        let mut violations = Vec::new();
        let mut suggestions = Vec::new();
        let mut warnings = Vec::new();

        for prereq in action.prerequisites {
            if !prerequisite_met(*prereq, analysis) {
                let severity = if *prereq == Prerequisite::ProjectInitialized {
                    ViolationSeverity::Critical
                } else {
                    ViolationSeverity::High
                };
                violations.push(Violation {
                    kind: ViolationKind::MissingPrerequisite,
                    severity,
                    message: format!("prerequisite not met: {prereq}"),
                    prerequisite: Some(*prereq),
                });
                suggestions.push(prerequisite_suggestion(*prereq).to_string());
            }
        }

        self.check_state_clashes(action, analysis, &mut violations, &mut suggestions);
        check_blockers(action, analysis, &mut violations);
        check_circular(action, analysis, &mut violations);

        if !analysis.blockers.is_empty() {
            warnings.push(format!(
                "{} active blocker(s) in the current workflow",
                analysis.blockers.len()
            ));
        }

        let has_critical = violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical);
        let high_count = violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::High)
            .count();

        let can_override = !has_critical && !violations.is_empty();
        let override_risk = if has_critical || HIGH_RISK_ACTIONS.contains(&action.id) {
            OverrideRisk::High
        } else if high_count > 2 {
            OverrideRisk::High
        } else if high_count > 0 {
            OverrideRisk::Medium
        } else {
            OverrideRisk::Low
        };

        let is_valid = violations.is_empty() || (allow_override && can_override);
        if is_valid && !violations.is_empty() {
            warnings.push(format!(
                "proceeding by override with {} violation(s), risk {:?}",
                violations.len(),
                override_risk
            ));
        }

        ActionValidation {
            action_id: action.id.to_string(),
            is_valid,
            violations,
            suggestions,
            warnings,
            can_override,
            override_risk,
        }
    }

    fn check_state_clashes(
        &self,
        action: &WorkflowAction,
        analysis: &WorkflowAnalysis,
        violations: &mut Vec<Violation>,
        suggestions: &mut Vec<String>,
    ) {
        match action.id {
            "init-project" if analysis.position != Position::NotInitialized => {
                violations.push(Violation {
                    kind: ViolationKind::IncompatibleState,
                    severity: ViolationSeverity::High,
                    message: "project is already initialized".to_string(),
                    prerequisite: None,
                });
                suggestions.push("use status to inspect the existing project".to_string());
            }
            "start-epic" => {
                if let Some(epic) = &analysis.current_epic {
                    if epic.metrics.progress_percent < 100.0 {
                        violations.push(Violation {
                            kind: ViolationKind::IncompatibleState,
                            severity: ViolationSeverity::High,
                            message: format!(
                                "epic '{}' is still at {:.0}% progress",
                                epic.title, epic.metrics.progress_percent
                            ),
                            prerequisite: None,
                        });
                        suggestions
                            .push("complete or close the current epic before starting another".to_string());
                    }
                }
            }
            _ => {}
        }
    }

    /// Whether a direct move between two positions is legal.
    pub fn validate_transition(from: Position, to: Position) -> bool {
        Self::allowed_transitions(from).contains(&to)
    }

    pub fn allowed_transitions(from: Position) -> &'static [Position] {
        match from {
            Position::NotInitialized => &[Position::Project],
            Position::Project => &[Position::Epic],
            Position::Epic => &[Position::Story, Position::Project],
            Position::Story => &[Position::Task, Position::Epic],
            Position::Task => &[Position::Story],
        }
    }

    /// Action IDs that currently validate cleanly, without overrides.
    pub fn allowed_actions(&self, analysis: &WorkflowAnalysis) -> Vec<&'static str> {
        self.registry
            .all()
            .iter()
            .filter(|a| self.validate_action(analysis, a.id, false).is_valid)
            .map(|a| a.id)
            .collect()
    }

    /// Actions that do not validate, with their violations.
    pub fn blocked_actions(
        &self,
        analysis: &WorkflowAnalysis,
    ) -> Vec<(&'static str, Vec<Violation>)> {
        self.registry
            .all()
            .iter()
            .filter_map(|a| {
                let validation = self.validate_action(analysis, a.id, false);
                if validation.is_valid {
                    None
                } else {
                    Some((a.id, validation.violations))
                }
            })
            .collect()
    }
}

fn prerequisite_met(prereq: Prerequisite, analysis: &WorkflowAnalysis) -> bool {
    match prereq {
        Prerequisite::ProjectInitialized => analysis.position != Position::NotInitialized,
        Prerequisite::HasEpics => analysis.metrics.epics_total > 0,
        Prerequisite::NoActiveEpic => analysis.current_epic.is_none(),
        Prerequisite::EpicInProgress => analysis
            .current_epic
            .as_ref()
            .map(|e| e.status.is_active())
            .unwrap_or(false),
        Prerequisite::StoryInProgress => analysis.current_story.is_some(),
        Prerequisite::TaskInProgress => !analysis.active_tasks.is_empty(),
        Prerequisite::AllTasksComplete => {
            analysis.metrics.tasks_total > 0 && analysis.active_tasks.is_empty()
        }
        Prerequisite::AllStoriesComplete => {
            analysis.metrics.stories_total > 0
                && analysis.metrics.stories_completed == analysis.metrics.stories_total
        }
        Prerequisite::EmptyDirectory => analysis.position == Position::NotInitialized,
    }
}

fn prerequisite_suggestion(prereq: Prerequisite) -> &'static str {
    match prereq {
        Prerequisite::ProjectInitialized => "run init-project first",
        Prerequisite::HasEpics => "create an epic with create-epic",
        Prerequisite::NoActiveEpic => "complete or close the current epic first",
        Prerequisite::EpicInProgress => "start an epic with start-epic",
        Prerequisite::StoryInProgress => "start a story with start-story",
        Prerequisite::TaskInProgress => "start a task with start-task",
        Prerequisite::AllTasksComplete => "finish or cancel the remaining tasks",
        Prerequisite::AllStoriesComplete => "finish the remaining stories first",
        Prerequisite::EmptyDirectory => "this directory already holds a project; use status",
    }
}

fn check_blockers(
    action: &WorkflowAction,
    analysis: &WorkflowAnalysis,
    violations: &mut Vec<Violation>,
) {
    let is_complete = action.id.starts_with("complete-");
    for blocker in &analysis.blockers {
        let applies = match blocker.kind {
            BlockerKind::MissingDefinition => matches!(
                action.id,
                "continue-epic" | "complete-epic" | "continue-story" | "complete-story"
            ),
            BlockerKind::MissingDependency => {
                matches!(action.id, "continue-task" | "complete-task")
            }
            BlockerKind::InconsistentState => is_complete,
        };
        if !applies {
            continue;
        }
        let severity = match blocker.kind {
            BlockerKind::InconsistentState => ViolationSeverity::Critical,
            _ => ViolationSeverity::High,
        };
        violations.push(Violation {
            kind: ViolationKind::ActiveBlocker,
            severity,
            message: blocker.message.clone(),
            prerequisite: None,
        });
    }
}

/// Narrow heuristic: an epic that both depends on and blocks the same
/// sibling cannot be completed cleanly.
fn check_circular(
    action: &WorkflowAction,
    analysis: &WorkflowAnalysis,
    violations: &mut Vec<Violation>,
) {
    if action.id != "complete-epic" {
        return;
    }
    let Some(epic) = &analysis.current_epic else {
        return;
    };
    let overlap: Vec<&String> = epic
        .dependencies
        .iter()
        .filter(|d| epic.blocks.contains(d))
        .collect();
    if !overlap.is_empty() {
        violations.push(Violation {
            kind: ViolationKind::CircularDependency,
            severity: ViolationSeverity::High,
            message: format!(
                "epic '{}' both depends on and blocks {:?}",
                epic.title, overlap
            ),
            prerequisite: None,
        });
    }
}
