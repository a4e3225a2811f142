//! Corruption detection and recovery for persisted JSON documents.
//!
//! A scan walks a fixed pipeline: access → size → encoding → JSON syntax →
//! recorded checksum → schema. Critical findings short-circuit the later
//! stages; everything found becomes an issue with a severity and, where
//! possible, a targeted suggestion. Scans never mutate the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use tokio::fs;
use walkdir::WalkDir;

use waypoint_model::{
    EntityKind, EpicState, ProjectState, StateCollection, StoryState, TaskState, ValidationReport,
    Validator,
};

use crate::atomic::AtomicStore;
use crate::error::Result;
use crate::hash::sha256_hex;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Access,
    Partial,
    Encoding,
    Syntax,
    Checksum,
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    pub recoverable: bool,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    RestoreBackup,
    Rebuild,
    ManualEdit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOption {
    pub kind: RecoveryKind,
    pub risk: Risk,
    pub description: String,
    /// Whether [`CorruptionDetector::auto_repair`] can execute this option.
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub path: PathBuf,
    pub exists: bool,
    pub file_size: u64,
    pub modified_unix_ms: Option<u64>,
    pub checksum: Option<String>,
    pub issues: Vec<Issue>,
    pub recovery: Vec<RecoveryOption>,
    pub scan_duration: Duration,
}

impl ScanReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub applied: Option<RecoveryKind>,
    pub healthy: bool,
    pub messages: Vec<String>,
}

/// Read-only scanner plus the one repair it can safely execute.
pub struct CorruptionDetector {
    store: Arc<AtomicStore>,
    validator: Validator,
}

impl CorruptionDetector {
    pub fn new(store: Arc<AtomicStore>) -> Self {
        Self {
            store,
            validator: Validator::new(),
        }
    }

    /// Scan one document. `kind` enables the schema stage; `None` stops after
    /// the syntax and checksum stages.
    pub async fn scan_file(&self, path: &Path, kind: Option<EntityKind>) -> ScanReport {
        let started = Instant::now();
        let mut report = ScanReport {
            path: path.to_path_buf(),
            exists: false,
            file_size: 0,
            modified_unix_ms: None,
            checksum: None,
            issues: Vec::new(),
            recovery: Vec::new(),
            scan_duration: Duration::ZERO,
        };

        self.run_pipeline(path, kind, &mut report).await;
        report.recovery = self.recovery_options(path, &report).await;
        report.scan_duration = started.elapsed();
        report
    }

    async fn run_pipeline(&self, path: &Path, kind: Option<EntityKind>, report: &mut ScanReport) {
        let meta = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.issues.push(issue(
                    IssueKind::Access,
                    Severity::Critical,
                    "file does not exist",
                    true,
                    Some("restore from backup or recreate the document"),
                ));
                return;
            }
            Err(e) => {
                report.issues.push(issue(
                    IssueKind::Access,
                    Severity::Critical,
                    format!("cannot stat file: {e}"),
                    false,
                    None,
                ));
                return;
            }
        };
        report.exists = true;
        report.file_size = meta.len();
        report.modified_unix_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);

        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                report.issues.push(issue(
                    IssueKind::Access,
                    Severity::Critical,
                    format!("cannot read file: {e}"),
                    false,
                    None,
                ));
                return;
            }
        };
        report.checksum = Some(sha256_hex(&bytes));

        if bytes.is_empty() {
            report.issues.push(issue(
                IssueKind::Partial,
                Severity::Critical,
                "file is empty; write was likely interrupted",
                true,
                Some("restore from backup"),
            ));
            return;
        }
        if bytes.len() < 10 {
            report.issues.push(issue(
                IssueKind::Partial,
                Severity::Major,
                format!("file is only {} bytes; likely truncated", bytes.len()),
                true,
                Some("restore from backup"),
            ));
        }

        if bytes.contains(&0) {
            report.issues.push(issue(
                IssueKind::Encoding,
                Severity::Major,
                "file contains NUL bytes",
                true,
                Some("content was likely corrupted at the block level; restore from backup"),
            ));
        }
        if std::str::from_utf8(&bytes).is_err() {
            report.issues.push(issue(
                IssueKind::Encoding,
                Severity::Major,
                "file is not valid UTF-8",
                true,
                Some("re-save the document as UTF-8 without BOM"),
            ));
        }

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                let msg = e.to_string();
                let suggestion = suggest_json_fix(&msg);
                report.issues.push(issue(
                    IssueKind::Syntax,
                    Severity::Critical,
                    format!("invalid JSON: {msg}"),
                    true,
                    suggestion.as_deref(),
                ));
                return;
            }
        };

        if let (Some(recorded), Some(actual)) =
            (self.store.recorded_checksum(path), report.checksum.as_ref())
        {
            if &recorded != actual {
                report.issues.push(issue(
                    IssueKind::Checksum,
                    Severity::Major,
                    "checksum differs from the last recorded write; file was modified outside the store",
                    true,
                    Some("verify the external change, then rewrite through the store"),
                ));
            }
        }

        if let Some(kind) = kind {
            self.check_schema(kind, value, report);
        }
    }

    fn check_schema(&self, kind: EntityKind, value: serde_json::Value, report: &mut ScanReport) {
        let validation: ValidationReport = match kind {
            EntityKind::Project => match serde_json::from_value::<ProjectState>(value) {
                Ok(v) => self.validator.validate_project(&v),
                Err(e) => return push_shape_issue(report, kind, e),
            },
            EntityKind::Epic => match serde_json::from_value::<EpicState>(value) {
                Ok(v) => self.validator.validate_epic(&v),
                Err(e) => return push_shape_issue(report, kind, e),
            },
            EntityKind::Story => match serde_json::from_value::<StoryState>(value) {
                Ok(v) => self.validator.validate_story(&v),
                Err(e) => return push_shape_issue(report, kind, e),
            },
            EntityKind::Task => match serde_json::from_value::<TaskState>(value) {
                Ok(v) => self.validator.validate_task(&v),
                Err(e) => return push_shape_issue(report, kind, e),
            },
            EntityKind::Collection => match serde_json::from_value::<StateCollection>(value) {
                Ok(v) => self.validator.validate_collection(&v),
                Err(e) => return push_shape_issue(report, kind, e),
            },
        };
        for err in validation.errors {
            report.issues.push(issue(
                IssueKind::Schema,
                Severity::Major,
                format!("{}: {}", err.field, err.message),
                true,
                None,
            ));
        }
        for warn in validation.warnings {
            report.issues.push(issue(
                IssueKind::Schema,
                Severity::Minor,
                format!("{}: {}", warn.field, warn.message),
                true,
                None,
            ));
        }
    }

    async fn recovery_options(&self, path: &Path, report: &ScanReport) -> Vec<RecoveryOption> {
        if report.is_healthy() {
            return Vec::new();
        }
        let mut options = Vec::new();

        if let Ok(backups) = self.store.list_backups(path).await {
            if let Some(newest) = backups.first() {
                options.push(RecoveryOption {
                    kind: RecoveryKind::RestoreBackup,
                    risk: Risk::Low,
                    description: format!(
                        "restore the most recent backup ({})",
                        newest.path.display()
                    ),
                    executable: true,
                });
            }
        }

        let only_schema = !report.has_critical()
            && report.issues.iter().all(|i| i.kind == IssueKind::Schema);
        if only_schema {
            options.push(RecoveryOption {
                kind: RecoveryKind::Rebuild,
                risk: Risk::Medium,
                description: "regenerate the document from related state".to_string(),
                executable: false,
            });
        }

        options.push(RecoveryOption {
            kind: RecoveryKind::ManualEdit,
            risk: Risk::High,
            description: "edit the file by hand, then re-scan".to_string(),
            executable: false,
        });
        options
    }

    /// Try recovery options in ascending risk. Only backup restore executes;
    /// everything else is reported as requiring manual action.
    pub async fn auto_repair(&self, path: &Path, kind: Option<EntityKind>) -> Result<RepairOutcome> {
        let report = self.scan_file(path, kind).await;
        if report.is_healthy() {
            return Ok(RepairOutcome {
                applied: None,
                healthy: true,
                messages: vec!["file is healthy; nothing to repair".to_string()],
            });
        }

        let mut options = report.recovery.clone();
        options.sort_by_key(|o| o.risk);
        let mut messages = Vec::new();

        for option in options {
            if !option.executable {
                messages.push(format!(
                    "skipped {:?} ({:?} risk): requires manual action",
                    option.kind, option.risk
                ));
                continue;
            }
            match option.kind {
                RecoveryKind::RestoreBackup => {
                    let backup = self.store.restore_latest_backup(path).await?;
                    messages.push(format!("restored from {}", backup.display()));
                    let after = self.scan_file(path, kind).await;
                    return Ok(RepairOutcome {
                        applied: Some(RecoveryKind::RestoreBackup),
                        healthy: after.is_healthy(),
                        messages,
                    });
                }
                RecoveryKind::Rebuild | RecoveryKind::ManualEdit => {}
            }
        }

        Ok(RepairOutcome {
            applied: None,
            healthy: false,
            messages,
        })
    }

    /// Scan every JSON document under `dir`, skipping store sidecars.
    pub async fn scan_directory(&self, dir: &Path) -> Result<Vec<ScanReport>> {
        let dir_owned = dir.to_path_buf();
        let files = crate::atomic::spawn_io(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&dir_owned).into_iter().flatten() {
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if is_sidecar(path) {
                    continue;
                }
                out.push(path.to_path_buf());
            }
            Ok(out)
        })
        .await?;

        let mut reports = Vec::with_capacity(files.len());
        for file in files {
            reports.push(self.scan_file(&file, None).await);
        }
        Ok(reports)
    }
}

fn is_sidecar(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.contains(".backup.")
        || name.contains(".tx_backup.")
        || name.starts_with(".tmp_")
        || paths::is_lock_sidecar(path)
}

fn issue(
    kind: IssueKind,
    severity: Severity,
    message: impl Into<String>,
    recoverable: bool,
    suggestion: Option<&str>,
) -> Issue {
    Issue {
        kind,
        severity,
        message: message.into(),
        recoverable,
        suggestion: suggestion.map(str::to_string),
    }
}

fn push_shape_issue(report: &mut ScanReport, kind: EntityKind, e: serde_json::Error) {
    report.issues.push(issue(
        IssueKind::Schema,
        Severity::Major,
        format!("document does not match the {kind} schema: {e}"),
        true,
        None,
    ));
}

/// Map serde_json parse messages to actionable hints.
fn suggest_json_fix(message: &str) -> Option<String> {
    let hint = if message.contains("EOF while parsing") {
        "file appears truncated; restore from backup"
    } else if message.contains("trailing characters") {
        "extra data after the JSON document; remove everything past the closing brace"
    } else if message.contains("control character") {
        "unescaped control character inside a string value"
    } else if message.contains("expected `,`") || message.contains("expected ','") {
        "missing comma or closing delimiter near the reported position"
    } else if message.contains("invalid") {
        "invalid character; check for unescaped quotes"
    } else if message.contains("duplicate") {
        "duplicate object key; keep only one"
    } else {
        return None;
    };
    Some(hint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::WriteOptions;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;
    use waypoint_model::Metadata;

    fn detector(store: Arc<AtomicStore>) -> CorruptionDetector {
        CorruptionDetector::new(store)
    }

    #[tokio::test]
    async fn healthy_file_has_no_issues() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("task.json");
        let store = Arc::new(AtomicStore::new());
        let task = TaskState {
            meta: Metadata::new("task-1"),
            story_id: "story-1".into(),
            title: "Implement scanner".into(),
            ..Default::default()
        };
        store
            .write_json(&path, &task, &WriteOptions::default())
            .await
            .expect("write");

        let report = detector(store).scan_file(&path, Some(EntityKind::Task)).await;
        assert!(report.is_healthy(), "issues: {:?}", report.issues);
        assert!(report.recovery.is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_critical_partial() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("task.json");
        std::fs::write(&path, b"").expect("seed");

        let store = Arc::new(AtomicStore::new());
        let report = detector(store).scan_file(&path, None).await;
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, IssueKind::Partial);
        assert_eq!(report.issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn truncated_json_suggests_backup_restore() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("task.json");
        std::fs::write(&path, br#"{"meta":{"id":"task-1"},"title":"cut of"#).expect("seed");

        let store = Arc::new(AtomicStore::new());
        let report = detector(store).scan_file(&path, None).await;
        let syntax = report
            .issues
            .iter()
            .find(|i| i.kind == IssueKind::Syntax)
            .expect("syntax issue");
        assert_eq!(syntax.severity, Severity::Critical);
        assert!(
            syntax.suggestion.as_deref().unwrap_or("").contains("truncated"),
            "suggestion: {:?}",
            syntax.suggestion
        );
    }

    #[tokio::test]
    async fn external_edit_flags_checksum_issue() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("doc.json");
        let store = Arc::new(AtomicStore::new());
        store
            .write_json(&path, &json!({"v": 1}), &WriteOptions::default())
            .await
            .expect("write");
        std::fs::write(&path, br#"{"v": 2}"#).expect("tamper");

        let report = detector(store).scan_file(&path, None).await;
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::Checksum));
    }

    #[tokio::test]
    async fn schema_findings_enable_rebuild_option() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("task.json");
        // Valid JSON, valid shape, but an empty title.
        std::fs::write(&path, br#"{"meta":{"id":"task-1"},"story_id":"s1","title":""}"#)
            .expect("seed");

        let store = Arc::new(AtomicStore::new());
        let report = detector(store).scan_file(&path, Some(EntityKind::Task)).await;
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::Schema));
        assert!(!report.has_critical());
        assert!(report
            .recovery
            .iter()
            .any(|o| o.kind == RecoveryKind::Rebuild && !o.executable));
        assert!(report
            .recovery
            .iter()
            .any(|o| o.kind == RecoveryKind::ManualEdit && o.risk == Risk::High));
    }

    #[tokio::test]
    async fn auto_repair_restores_from_backup() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("doc.json");
        let store = Arc::new(AtomicStore::new());
        store
            .write_json(&path, &json!({"v": 1}), &WriteOptions::default())
            .await
            .expect("first");
        store
            .write_json(&path, &json!({"v": 2}), &WriteOptions::default())
            .await
            .expect("second creates backup");
        std::fs::write(&path, b"{broken").expect("corrupt");

        let det = detector(store);
        let outcome = det.auto_repair(&path, None).await.expect("repair");
        assert_eq!(outcome.applied, Some(RecoveryKind::RestoreBackup));
        assert!(outcome.healthy, "messages: {:?}", outcome.messages);
    }

    #[tokio::test]
    async fn scan_directory_skips_sidecars() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("a.json"), b"{}").expect("seed");
        std::fs::write(dir.path().join("a.json.backup.100"), b"{}").expect("seed");
        std::fs::write(dir.path().join(".a.json.lock"), b"{}").expect("seed");
        std::fs::write(dir.path().join("notes.txt"), b"hi").expect("seed");

        let store = Arc::new(AtomicStore::new());
        let reports = detector(store)
            .scan_directory(dir.path())
            .await
            .expect("scan");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].path.ends_with("a.json"));
    }
}
