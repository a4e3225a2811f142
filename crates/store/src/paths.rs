//! On-disk layout of the docs tree and sidecar naming.
//!
//! ```text
//! docs/
//!   1-project/epics.json
//!   2-current-epic/current-epic.json
//!   2-current-epic/stories.json
//!   2-current-epic/interruption-stack.json
//!   3-current-task/<task>.json
//! ```
//!
//! Sidecars live next to their target: `<name>.backup.<unixSeconds>`,
//! `<name>.tx_backup.<nanos>`, `.<name>.lock`, `.tmp_<name>_<nanos>`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DOCS_DIR: &str = "docs";
pub const PROJECT_DIR: &str = "docs/1-project";
pub const EPICS_FILE: &str = "docs/1-project/epics.json";
pub const CURRENT_EPIC_DIR: &str = "docs/2-current-epic";
pub const CURRENT_EPIC_FILE: &str = "docs/2-current-epic/current-epic.json";
pub const STORIES_FILE: &str = "docs/2-current-epic/stories.json";
pub const INTERRUPTION_STACK_FILE: &str = "docs/2-current-epic/interruption-stack.json";
pub const TASK_DIR: &str = "docs/3-current-task";
/// Pointer file inside the task directory; not itself a task document.
pub const CURRENT_TASK_POINTER: &str = "current-task.json";

const BACKUP_INFIX: &str = ".backup.";
const TX_BACKUP_INFIX: &str = ".tx_backup.";
pub(crate) const LOCK_SUFFIX: &str = ".lock";

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
}

fn sibling(path: &Path, name: String) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Temp-file name used during atomic writes, unique per attempt.
pub fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, format!(".tmp_{}_{}", file_name(path), nanos()))
}

/// Timestamped backup sibling, second resolution.
pub fn backup_path(path: &Path) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    sibling(path, format!("{}{}{}", file_name(path), BACKUP_INFIX, secs))
}

/// Transaction backup sibling, nanosecond resolution to avoid collisions
/// within one commit.
pub fn tx_backup_path(path: &Path) -> PathBuf {
    sibling(
        path,
        format!("{}{}{}", file_name(path), TX_BACKUP_INFIX, nanos()),
    )
}

/// Hidden lock sidecar: `.<name>.lock` next to the target.
pub fn lock_sidecar_path(path: &Path) -> PathBuf {
    sibling(path, format!(".{}{}", file_name(path), LOCK_SUFFIX))
}

/// True when `candidate` is a backup of `target`, returning its timestamp.
pub fn backup_timestamp(target: &Path, candidate: &Path) -> Option<u64> {
    let prefix = format!("{}{}", file_name(target), BACKUP_INFIX);
    candidate
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(&prefix))
        .and_then(|ts| ts.parse().ok())
}

pub fn is_lock_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(LOCK_SUFFIX))
        .unwrap_or(false)
}

fn nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sidecars_stay_in_the_target_directory() {
        let target = Path::new("/work/docs/2-current-epic/stories.json");
        assert!(tmp_path(target).starts_with("/work/docs/2-current-epic"));
        assert!(backup_path(target).starts_with("/work/docs/2-current-epic"));
        assert_eq!(
            lock_sidecar_path(target),
            Path::new("/work/docs/2-current-epic/.stories.json.lock")
        );
    }

    #[test]
    fn backup_timestamp_parses_only_matching_names() {
        let target = Path::new("/w/epics.json");
        assert_eq!(
            backup_timestamp(target, Path::new("/w/epics.json.backup.1700000000")),
            Some(1_700_000_000)
        );
        assert_eq!(
            backup_timestamp(target, Path::new("/w/stories.json.backup.1700000000")),
            None
        );
        assert_eq!(backup_timestamp(target, Path::new("/w/epics.json")), None);
    }

    #[test]
    fn lock_sidecars_are_hidden_files() {
        assert!(is_lock_sidecar(Path::new("/w/.epics.json.lock")));
        assert!(!is_lock_sidecar(Path::new("/w/epics.json")));
    }
}
