use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file not found: {path:?}")]
    NotFound { path: PathBuf },

    #[error("write verification failed for {path:?}: wrote {expected_len} bytes, read back {actual_len}")]
    Verification {
        path: PathBuf,
        expected_len: u64,
        actual_len: u64,
    },

    #[error("checksum mismatch for {path:?}: file was modified outside the store")]
    ChecksumMismatch { path: PathBuf },

    #[error("lock on {path:?} is held by pid {owner_pid}")]
    LockConflict {
        path: PathBuf,
        owner_pid: u32,
        suggestion: Option<String>,
    },

    #[error("timed out acquiring lock on {path:?} after {attempts} attempts ({waited_ms}ms)")]
    LockTimeout {
        path: PathBuf,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("no backups found for {path:?}")]
    NoBackups { path: PathBuf },

    #[error("memory limit exceeded: grew {observed_bytes} bytes during the operation, limit {limit_bytes}")]
    MemoryLimit {
        observed_bytes: u64,
        limit_bytes: u64,
    },

    #[error("transaction failed at operation {index} ({path:?}), rolled back: {source}")]
    Transaction {
        index: usize,
        path: PathBuf,
        #[source]
        source: Box<StoreError>,
    },

    #[error("rollback failed for {path:?} after transaction error: {detail}")]
    RollbackFailed { path: PathBuf, detail: String },
}

impl StoreError {
    /// Errors the caller can reasonably recover from without operator help.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::LockConflict { .. }
                | StoreError::LockTimeout { .. }
                | StoreError::MemoryLimit { .. }
        )
    }
}
