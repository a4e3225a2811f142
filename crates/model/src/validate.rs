//! Structural validation for entities and collections.
//!
//! Validation never mutates and never panics on bad references; every finding
//! becomes a [`ValidationIssue`] with a field path so callers can surface it
//! verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::schema::{
    EpicState, ProjectState, StateCollection, Status, StoryState, TaskState,
};

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
});

const MAX_NAME_LEN: usize = 100;
const MAX_TITLE_LEN: usize = 200;
const STORY_POINT_WARN_MAX: u32 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Required,
    Format,
    Range,
    Logic,
    Reference,
    Consistency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub field: String,
    pub rule: RuleKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, rule: RuleKind, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            rule,
            message: message.into(),
        });
    }

    fn warn(&mut self, field: &str, rule: RuleKind, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            rule,
            message: message.into(),
        });
    }

    /// Absorb `other`, prefixing every field path (used when validating
    /// entities inside a collection).
    fn merge_prefixed(&mut self, prefix: &str, other: ValidationReport) {
        for mut issue in other.errors {
            issue.field = format!("{prefix}{}", issue.field);
            self.errors.push(issue);
        }
        for mut issue in other.warnings {
            issue.field = format!("{prefix}{}", issue.field);
            self.warnings.push(issue);
        }
    }
}

/// Rule-based entity validator. Stateless; construct once and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_project(&self, project: &ProjectState) -> ValidationReport {
        let mut report = ValidationReport::default();
        require(&mut report, "meta.id", &project.meta.id);
        require(&mut report, "name", &project.name);
        if !project.name.is_empty() {
            if project.name.len() > MAX_NAME_LEN {
                report.error(
                    "name",
                    RuleKind::Format,
                    format!("name exceeds {MAX_NAME_LEN} characters"),
                );
            }
            if !NAME_RE.is_match(&project.name) {
                report.error(
                    "name",
                    RuleKind::Format,
                    "name may only contain letters, digits, '-' and '_'",
                );
            }
        }
        check_progress(&mut report, "metrics.progress_percent", project.metrics.progress_percent);
        if project.description.as_deref().unwrap_or("").is_empty() {
            report.warn("description", RuleKind::Required, "project has no description");
        }
        report
    }

    pub fn validate_epic(&self, epic: &EpicState) -> ValidationReport {
        let mut report = ValidationReport::default();
        require(&mut report, "meta.id", &epic.meta.id);
        require(&mut report, "project_id", &epic.project_id);
        check_title(&mut report, &epic.title);
        check_hours(&mut report, "estimated_hours", epic.estimated_hours);
        check_hours(&mut report, "actual_hours", epic.actual_hours);
        check_self_dependency(&mut report, &epic.meta.id, &epic.dependencies);
        check_progress(&mut report, "metrics.progress_percent", epic.metrics.progress_percent);
        if epic.status == Status::Done && epic.metrics.progress_percent < 100.0 {
            report.warn(
                "status",
                RuleKind::Logic,
                "epic marked done while progress is below 100%",
            );
        }
        if epic.estimated_hours.is_none() {
            report.warn("estimated_hours", RuleKind::Required, "epic has no estimate");
        }
        report
    }

    pub fn validate_story(&self, story: &StoryState) -> ValidationReport {
        let mut report = ValidationReport::default();
        require(&mut report, "meta.id", &story.meta.id);
        require(&mut report, "epic_id", &story.epic_id);
        check_title(&mut report, &story.title);
        check_hours(&mut report, "estimated_hours", story.estimated_hours);
        check_hours(&mut report, "actual_hours", story.actual_hours);
        check_self_dependency(&mut report, &story.meta.id, &story.dependencies);
        check_progress(&mut report, "metrics.progress_percent", story.metrics.progress_percent);
        match story.story_points {
            Some(0) => report.warn("story_points", RuleKind::Range, "story points are zero"),
            Some(p) if p > STORY_POINT_WARN_MAX => report.warn(
                "story_points",
                RuleKind::Range,
                format!("story points above {STORY_POINT_WARN_MAX}; consider splitting"),
            ),
            _ => {}
        }
        for (i, criterion) in story.acceptance_criteria.iter().enumerate() {
            if criterion.description.is_empty() {
                report.error(
                    &format!("acceptance_criteria[{i}].description"),
                    RuleKind::Required,
                    "acceptance criterion has no description",
                );
            }
        }
        report
    }

    pub fn validate_task(&self, task: &TaskState) -> ValidationReport {
        let mut report = ValidationReport::default();
        require(&mut report, "meta.id", &task.meta.id);
        require(&mut report, "story_id", &task.story_id);
        check_title(&mut report, &task.title);
        check_hours(&mut report, "estimated_hours", task.estimated_hours);
        check_hours(&mut report, "actual_hours", task.actual_hours);
        check_self_dependency(&mut report, &task.meta.id, &task.dependencies);
        report
    }

    /// Validate every entity plus the cross-references between levels.
    pub fn validate_collection(&self, collection: &StateCollection) -> ValidationReport {
        let mut report = ValidationReport::default();

        for (key, project) in &collection.projects {
            let prefix = format!("projects[{key}].");
            check_key_consistency(&mut report, &prefix, key, &project.meta.id);
            report.merge_prefixed(&prefix, self.validate_project(project));
        }
        for (key, epic) in &collection.epics {
            let prefix = format!("epics[{key}].");
            check_key_consistency(&mut report, &prefix, key, &epic.meta.id);
            report.merge_prefixed(&prefix, self.validate_epic(epic));
            if !epic.project_id.is_empty() && !collection.projects.contains_key(&epic.project_id) {
                report.error(
                    &format!("{prefix}project_id"),
                    RuleKind::Reference,
                    format!("references unknown project '{}'", epic.project_id),
                );
            }
        }
        for (key, story) in &collection.stories {
            let prefix = format!("stories[{key}].");
            check_key_consistency(&mut report, &prefix, key, &story.meta.id);
            report.merge_prefixed(&prefix, self.validate_story(story));
            if !story.epic_id.is_empty() && !collection.epics.contains_key(&story.epic_id) {
                report.error(
                    &format!("{prefix}epic_id"),
                    RuleKind::Reference,
                    format!("references unknown epic '{}'", story.epic_id),
                );
            }
        }
        for (key, task) in &collection.tasks {
            let prefix = format!("tasks[{key}].");
            check_key_consistency(&mut report, &prefix, key, &task.meta.id);
            report.merge_prefixed(&prefix, self.validate_task(task));
            if !task.story_id.is_empty() && !collection.stories.contains_key(&task.story_id) {
                report.error(
                    &format!("{prefix}story_id"),
                    RuleKind::Reference,
                    format!("references unknown story '{}'", task.story_id),
                );
            }
        }
        report
    }
}

fn require(report: &mut ValidationReport, field: &str, value: &str) {
    if value.is_empty() {
        report.error(field, RuleKind::Required, format!("{field} is required"));
    }
}

fn check_title(report: &mut ValidationReport, title: &str) {
    require(report, "title", title);
    if title.len() > MAX_TITLE_LEN {
        report.error(
            "title",
            RuleKind::Format,
            format!("title exceeds {MAX_TITLE_LEN} characters"),
        );
    }
}

fn check_hours(report: &mut ValidationReport, field: &str, hours: Option<f64>) {
    if let Some(h) = hours {
        if h < 0.0 || !h.is_finite() {
            report.error(field, RuleKind::Range, "hours must be a non-negative number");
        }
    }
}

fn check_progress(report: &mut ValidationReport, field: &str, percent: f64) {
    if !(0.0..=100.0).contains(&percent) || !percent.is_finite() {
        report.error(field, RuleKind::Range, "progress must be between 0 and 100");
    }
}

fn check_self_dependency(report: &mut ValidationReport, id: &str, dependencies: &[String]) {
    if !id.is_empty() && dependencies.iter().any(|d| d == id) {
        report.error(
            "dependencies",
            RuleKind::Logic,
            "entity cannot depend on itself",
        );
    }
}

fn check_key_consistency(report: &mut ValidationReport, prefix: &str, key: &str, id: &str) {
    if !id.is_empty() && key != id {
        report.error(
            &format!("{prefix}meta.id"),
            RuleKind::Consistency,
            format!("map key '{key}' does not match entity id '{id}'"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Metadata, StoriesFile};
    use pretty_assertions::assert_eq;

    fn epic(id: &str) -> EpicState {
        EpicState {
            meta: Metadata::new(id),
            project_id: "proj-1".into(),
            title: "Authentication".into(),
            estimated_hours: Some(8.0),
            ..Default::default()
        }
    }

    #[test]
    fn valid_epic_passes() {
        let report = Validator::new().validate_epic(&epic("epic-1"));
        assert!(report.is_valid(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut e = epic("epic-1");
        e.dependencies.push("epic-1".into());
        let report = Validator::new().validate_epic(&e);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].rule, RuleKind::Logic);
    }

    #[test]
    fn project_name_format_is_enforced() {
        let project = ProjectState {
            meta: Metadata::new("proj-1"),
            name: "my project!".into(),
            ..Default::default()
        };
        let report = Validator::new().validate_project(&project);
        assert!(report
            .errors
            .iter()
            .any(|i| i.field == "name" && i.rule == RuleKind::Format));
    }

    #[test]
    fn negative_hours_are_rejected() {
        let mut e = epic("epic-1");
        e.actual_hours = Some(-2.0);
        let report = Validator::new().validate_epic(&e);
        assert!(report
            .errors
            .iter()
            .any(|i| i.field == "actual_hours" && i.rule == RuleKind::Range));
    }

    #[test]
    fn collection_flags_dangling_parent_and_bad_key() {
        let mut collection = StateCollection::default();
        let mut e = epic("epic-1");
        e.project_id = "missing".into();
        collection.epics.insert("wrong-key".into(), e);

        let report = Validator::new().validate_collection(&collection);
        assert!(report
            .errors
            .iter()
            .any(|i| i.rule == RuleKind::Consistency && i.field.starts_with("epics[wrong-key]")));
        assert!(report
            .errors
            .iter()
            .any(|i| i.rule == RuleKind::Reference && i.field.ends_with("project_id")));
    }

    #[test]
    fn stories_file_parses_with_current_story() {
        let json = r#"{"stories":[],"meta":{"current_story":"story-3"}}"#;
        let file: StoriesFile = serde_json::from_str(json).expect("deserialize");
        assert_eq!(file.meta.current_story.as_deref(), Some("story-3"));
    }
}
