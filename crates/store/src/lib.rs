//! # Waypoint Store
//!
//! Crash-safe JSON persistence with cross-process locking, corruption
//! detection, and size-tiered I/O.
//!
//! ## Write path
//!
//! ```text
//! value
//!     │
//!     ├──> serialize (pretty JSON)
//!     │      └─> .tmp_<name>_<nanos>  (write + fsync)
//!     │
//!     ├──> verify (length + SHA-256 read-back)
//!     │
//!     └──> rename over target
//!            └─> <name>.backup.<secs> kept from before the write
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use waypoint_store::{AtomicStore, WriteOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = AtomicStore::new();
//!     let path = std::path::Path::new("docs/2-current-epic/stories.json");
//!
//!     store
//!         .write_json(path, &serde_json::json!({"stories": []}), &WriteOptions::default())
//!         .await?;
//!     Ok(())
//! }
//! ```

mod atomic;
mod corruption;
mod error;
mod hash;
mod lock;
mod lock_manager;
mod memory;
pub mod paths;
mod tiered;
mod transaction;

pub use atomic::{AtomicStore, BackupEntry, GitHook, WriteOptions};
pub use corruption::{
    CorruptionDetector, Issue, IssueKind, RecoveryKind, RecoveryOption, RepairOutcome, Risk,
    ScanReport, Severity,
};
pub use error::{Result, StoreError};
pub use hash::sha256_hex;
pub use lock::{
    FileLock, Fs2Lock, LockInfo, LockOptions, LockOutcome, LockStatus, LockType, PlatformLock,
};
pub use lock_manager::{LockManager, LockMetricsSnapshot};
pub use memory::current_rss_bytes;
pub use tiered::{
    BenchReport, PerfSnapshot, TieredOptions, TieredStateManager, LARGE_FILE_BYTES,
    SMALL_FILE_BYTES,
};
pub use transaction::Transaction;
