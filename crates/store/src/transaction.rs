//! Multi-file batch operations with rollback.
//!
//! A transaction snapshots every target it will touch, applies operations in
//! order, and restores the snapshots if any operation fails. Rollback covers
//! in-process failures only; a crash mid-commit can leave a partial batch
//! plus `.tx_backup.*` files for manual recovery.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::atomic::{AtomicStore, WriteOptions};
use crate::error::{Result, StoreError};
use crate::paths;

enum TxOp {
    Write { path: PathBuf, bytes: Vec<u8> },
    Delete { path: PathBuf },
}

impl TxOp {
    fn path(&self) -> &Path {
        match self {
            TxOp::Write { path, .. } | TxOp::Delete { path } => path,
        }
    }
}

/// Queued batch of writes and deletes against one [`AtomicStore`].
pub struct Transaction<'a> {
    store: &'a AtomicStore,
    ops: Vec<TxOp>,
}

impl AtomicStore {
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            ops: Vec::new(),
        }
    }
}

impl<'a> Transaction<'a> {
    /// Queue a JSON write. Serialization happens now so a bad value fails
    /// before anything touches disk.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.ops.push(TxOp::Write {
            path: path.to_path_buf(),
            bytes,
        });
        Ok(())
    }

    pub fn delete(&mut self, path: &Path) {
        self.ops.push(TxOp::Delete {
            path: path.to_path_buf(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply all operations in order. On the first failure, every
    /// already-applied target is restored from its transaction backup
    /// (newly-created files are removed) before the error is returned.
    pub async fn commit(self) -> Result<()> {
        // Phase 1: snapshot every pre-existing target.
        let mut snapshots: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let target = op.path().to_path_buf();
            let snapshot = if fs::try_exists(&target).await? {
                let backup = paths::tx_backup_path(&target);
                fs::copy(&target, &backup).await?;
                Some(backup)
            } else {
                None
            };
            snapshots.push((target, snapshot));
        }

        // Phase 2: apply in order.
        let write_opts = WriteOptions {
            backup: false,
            ..Default::default()
        };
        for (index, op) in self.ops.iter().enumerate() {
            let result = match op {
                TxOp::Write { path, bytes } => {
                    self.store
                        .write_bytes(path, bytes.clone(), &write_opts)
                        .await
                }
                TxOp::Delete { path } => self.store.delete(path, false).await,
            };
            if let Err(source) = result {
                let failed_path = op.path().to_path_buf();
                rollback(&snapshots[..index]).await;
                cleanup(&snapshots).await;
                return Err(StoreError::Transaction {
                    index,
                    path: failed_path,
                    source: Box::new(source),
                });
            }
        }

        // Phase 3: drop the snapshots.
        cleanup(&snapshots).await;
        Ok(())
    }
}

/// Restore the applied prefix, newest first.
async fn rollback(applied: &[(PathBuf, Option<PathBuf>)]) {
    for (target, snapshot) in applied.iter().rev() {
        let result = match snapshot {
            Some(backup) => fs::copy(backup, target).await.map(|_| ()),
            None => match fs::remove_file(target).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            // Nothing further to do; the tx backup stays on disk for manual
            // recovery and the error is surfaced in the log.
            log::error!("rollback failed for {}: {e}", target.display());
        }
    }
}

async fn cleanup(snapshots: &[(PathBuf, Option<PathBuf>)]) {
    for (_, snapshot) in snapshots {
        if let Some(backup) = snapshot {
            if let Err(e) = fs::remove_file(backup).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove tx backup {}: {e}", backup.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn commit_applies_all_operations() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::new();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");

        let mut tx = store.begin();
        tx.write_json(&a, &json!({"v": 1})).expect("queue a");
        tx.write_json(&b, &json!({"v": 2})).expect("queue b");
        tx.commit().await.expect("commit");

        let a_val: serde_json::Value = store.read_json(&a).await.expect("read a");
        assert_eq!(a_val, json!({"v": 1}));
        assert!(store.exists(&b).await);
    }

    #[tokio::test]
    async fn failed_delete_rolls_back_earlier_writes() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::new();
        let existing = dir.path().join("existing.json");
        let fresh = dir.path().join("fresh.json");
        let missing = dir.path().join("missing.json");

        store
            .write_json(&existing, &json!({"v": "old"}), &WriteOptions::default())
            .await
            .expect("seed");

        let mut tx = store.begin();
        tx.write_json(&existing, &json!({"v": "new"})).expect("queue");
        tx.write_json(&fresh, &json!({"v": 1})).expect("queue");
        tx.delete(&missing); // fails: file does not exist
        let err = tx.commit().await.expect_err("commit must fail");

        match &err {
            StoreError::Transaction { index, source, .. } => {
                assert_eq!(*index, 2);
                assert!(matches!(**source, StoreError::NotFound { .. }));
            }
            other => panic!("expected Transaction error, got {other:?}"),
        }

        // Pre-existing file restored, new file removed.
        let val: serde_json::Value = store.read_json(&existing).await.expect("read");
        assert_eq!(val, json!({"v": "old"}));
        assert!(!store.exists(&fresh).await, "newly created file removed");
    }

    #[tokio::test]
    async fn successful_commit_leaves_no_tx_backups() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::new();
        let path = dir.path().join("a.json");
        store
            .write_json(&path, &json!({"v": 0}), &WriteOptions::default())
            .await
            .expect("seed");

        let mut tx = store.begin();
        tx.write_json(&path, &json!({"v": 1})).expect("queue");
        tx.commit().await.expect("commit");

        for entry in std::fs::read_dir(dir.path()).expect("read_dir") {
            let name = entry.expect("entry").file_name();
            let name = name.to_string_lossy().into_owned();
            assert!(
                !name.contains(".tx_backup."),
                "leftover tx backup: {name}"
            );
        }
    }

    #[tokio::test]
    async fn empty_transaction_commits_cleanly() {
        let store = AtomicStore::new();
        let tx = store.begin();
        assert!(tx.is_empty());
        tx.commit().await.expect("empty commit");
    }
}
