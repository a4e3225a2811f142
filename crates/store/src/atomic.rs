//! Crash-safe JSON persistence.
//!
//! Writes never touch the target in place: content goes to a temp file in the
//! same directory, is fsynced, optionally verified by reading it back, then
//! renamed over the target. A successful write leaves either the old content
//! or the new content on disk, never a mix.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::{Result, StoreError};
use crate::hash::{sha256_hex, sha256_hex_reader};
use crate::lock::{FileLock, Fs2Lock, LockOptions, PlatformLock};
use crate::paths;

/// Optional post-write version-control hook. Failures are logged, never
/// propagated; persistence must not depend on a working git checkout.
#[async_trait]
pub trait GitHook: Send + Sync {
    async fn auto_version_on_write(&self, path: &Path, message: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Copy the current content to `<name>.backup.<secs>` before replacing it.
    pub backup: bool,
    /// Read the temp file back and compare length + checksum before renaming.
    pub verify: bool,
    /// Hold the cross-process file lock for the duration of the write.
    pub lock: bool,
    pub lock_timeout: Duration,
    /// Commit message for the git hook; `None` skips the hook.
    pub git_commit_message: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backup: true,
            verify: true,
            lock: false,
            lock_timeout: Duration::from_secs(30),
            git_commit_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub timestamp_secs: u64,
}

/// Atomic JSON store with per-file checksum tracking.
pub struct AtomicStore {
    checksums: Mutex<HashMap<PathBuf, String>>,
    git_hook: Option<Arc<dyn GitHook>>,
    platform: Arc<dyn PlatformLock>,
}

impl Default for AtomicStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicStore {
    pub fn new() -> Self {
        Self {
            checksums: Mutex::new(HashMap::new()),
            git_hook: None,
            platform: Arc::new(Fs2Lock),
        }
    }

    pub fn with_git_hook(hook: Arc<dyn GitHook>) -> Self {
        Self {
            checksums: Mutex::new(HashMap::new()),
            git_hook: Some(hook),
            platform: Arc::new(Fs2Lock),
        }
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
        opts: &WriteOptions,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(path, bytes, opts).await
    }

    pub async fn write_bytes(&self, path: &Path, bytes: Vec<u8>, opts: &WriteOptions) -> Result<()> {
        let lock = if opts.lock {
            let lock_opts = LockOptions {
                timeout: opts.lock_timeout,
                ..Default::default()
            };
            Some(FileLock::acquire(path, &lock_opts, Arc::clone(&self.platform)).await?)
        } else {
            None
        };

        let result = self.write_locked(path, bytes, opts).await;

        if let Some(lock) = lock {
            if let Err(e) = lock.release().await {
                log::warn!("failed to release write lock on {}: {e}", path.display());
            }
        }
        result?;

        if let (Some(hook), Some(message)) = (&self.git_hook, &opts.git_commit_message) {
            if let Err(e) = hook.auto_version_on_write(path, message).await {
                log::warn!("git hook failed for {}: {e}", path.display());
            }
        }
        Ok(())
    }

    async fn write_locked(&self, path: &Path, bytes: Vec<u8>, opts: &WriteOptions) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        if opts.backup && fs::try_exists(path).await? {
            let backup = paths::backup_path(path);
            fs::copy(path, &backup).await?;
            log::debug!("backed up {} -> {}", path.display(), backup.display());
        }

        let tmp = paths::tmp_path(path);
        let result = self.write_tmp_and_rename(path, &tmp, bytes, opts.verify).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    async fn write_tmp_and_rename(
        &self,
        path: &Path,
        tmp: &Path,
        bytes: Vec<u8>,
        verify: bool,
    ) -> Result<()> {
        let expected_len = bytes.len() as u64;
        let checksum = sha256_hex(&bytes);

        let tmp_owned = tmp.to_path_buf();
        spawn_io(move || {
            let mut file = std::fs::File::create(&tmp_owned)?;
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .await?;

        if verify {
            let tmp_owned = tmp.to_path_buf();
            let (actual_checksum, actual_len) = spawn_io(move || {
                let mut file = std::fs::File::open(&tmp_owned)?;
                sha256_hex_reader(&mut file)
            })
            .await?;
            if actual_len != expected_len || actual_checksum != checksum {
                return Err(StoreError::Verification {
                    path: path.to_path_buf(),
                    expected_len,
                    actual_len,
                });
            }
        }

        fs::rename(tmp, path).await?;
        self.record_checksum(path, checksum);
        Ok(())
    }

    pub async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = self.read_bytes(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read and additionally compare against the checksum recorded at the
    /// last write, when one exists.
    pub async fn read_json_verified<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = self.read_bytes(path).await?;
        if let Some(recorded) = self.recorded_checksum(path) {
            if sha256_hex(&bytes) != recorded {
                return Err(StoreError::ChecksumMismatch {
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn delete(&self, path: &Path, backup: bool) -> Result<()> {
        if !fs::try_exists(path).await? {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if backup {
            fs::copy(path, paths::backup_path(path)).await?;
        }
        fs::remove_file(path).await?;
        self.checksums
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        Ok(())
    }

    /// Backups of `path`, newest first.
    pub async fn list_backups(&self, path: &Path) -> Result<Vec<BackupEntry>> {
        let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        let mut reader = match fs::read_dir(dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let candidate = entry.path();
            if let Some(timestamp_secs) = paths::backup_timestamp(path, &candidate) {
                entries.push(BackupEntry {
                    path: candidate,
                    timestamp_secs,
                });
            }
        }
        entries.sort_by(|a, b| b.timestamp_secs.cmp(&a.timestamp_secs));
        Ok(entries)
    }

    /// Replace `path` with its newest backup, atomically.
    pub async fn restore_latest_backup(&self, path: &Path) -> Result<PathBuf> {
        let backups = self.list_backups(path).await?;
        let newest = backups.first().ok_or_else(|| StoreError::NoBackups {
            path: path.to_path_buf(),
        })?;
        let bytes = fs::read(&newest.path).await?;
        let opts = WriteOptions {
            backup: false,
            ..Default::default()
        };
        self.write_bytes(path, bytes, &opts).await?;
        log::info!(
            "restored {} from backup {}",
            path.display(),
            newest.path.display()
        );
        Ok(newest.path.clone())
    }

    /// Delete all but the newest `keep` backups. Returns the number removed.
    pub async fn prune_backups(&self, path: &Path, keep: usize) -> Result<usize> {
        let backups = self.list_backups(path).await?;
        let mut removed = 0;
        for entry in backups.iter().skip(keep) {
            fs::remove_file(&entry.path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn recorded_checksum(&self, path: &Path) -> Option<String> {
        self.checksums
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub(crate) fn record_checksum(&self, path: &Path, checksum: String) {
        self.checksums
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), checksum);
    }

    pub(crate) fn platform(&self) -> Arc<dyn PlatformLock> {
        Arc::clone(&self.platform)
    }

    pub(crate) fn git_hook(&self) -> Option<&Arc<dyn GitHook>> {
        self.git_hook.as_ref()
    }
}

/// Run a blocking filesystem closure on the blocking pool.
pub(crate) async fn spawn_io<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    let out = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(out)
}
