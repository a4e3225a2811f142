//! Process-wide lock registry.
//!
//! Deduplicates repeat acquisitions of the same path inside one process,
//! aggregates metrics, and runs a background sweep that clears stale lock
//! sidecars left behind by crashed processes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::lock::{is_stale, FileLock, Fs2Lock, LockInfo, LockOptions, PlatformLock};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LockMetricsSnapshot {
    pub requests: u64,
    pub acquired: u64,
    pub conflicts: u64,
    pub timeouts: u64,
    pub released: u64,
    pub stale_cleared: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: u64,
}

#[derive(Default)]
struct Metrics {
    requests: AtomicU64,
    acquired: AtomicU64,
    conflicts: AtomicU64,
    timeouts: AtomicU64,
    released: AtomicU64,
    stale_cleared: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
}

struct Held {
    lock: FileLock,
    holders: u32,
}

struct Inner {
    locks: Mutex<HashMap<PathBuf, Held>>,
    metrics: Metrics,
    platform: Arc<dyn PlatformLock>,
    sweep_dirs: Mutex<HashSet<PathBuf>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Shared, clonable lock registry. Construct one per process and inject it;
/// there is deliberately no global instance.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_platform(Arc::new(Fs2Lock))
    }

    pub fn with_platform(platform: Arc<dyn PlatformLock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                locks: Mutex::new(HashMap::new()),
                metrics: Metrics::default(),
                platform,
                sweep_dirs: Mutex::new(HashSet::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Acquire (or re-enter) the lock for `path`.
    pub async fn lock(&self, path: &Path, opts: &LockOptions) -> Result<()> {
        let key = canonical_key(path);
        self.inner.metrics.requests.fetch_add(1, Ordering::Relaxed);

        {
            let mut locks = self.inner.locks.lock().await;
            if let Some(held) = locks.get_mut(&key) {
                held.holders += 1;
                self.inner.metrics.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let acquired =
            match FileLock::acquire(&key, opts, Arc::clone(&self.inner.platform)).await {
                Ok(lock) => lock,
                Err(e) => {
                    match &e {
                        StoreError::LockTimeout { .. } => {
                            self.inner.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                        StoreError::LockConflict { .. } => {
                            self.inner.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                    return Err(e);
                }
            };

        let waited_ms = acquired.outcome().waited.as_millis() as u64;
        self.inner.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .total_wait_ms
            .fetch_add(waited_ms, Ordering::Relaxed);
        self.inner
            .metrics
            .max_wait_ms
            .fetch_max(waited_ms, Ordering::Relaxed);

        let mut locks = self.inner.locks.lock().await;
        match locks.get_mut(&key) {
            // Another task in this process won the race while we acquired;
            // fold into its entry and drop our OS lock.
            Some(held) => {
                held.holders += 1;
                if let Err(e) = acquired.release().await {
                    log::warn!("failed to release duplicate lock on {}: {e}", key.display());
                }
            }
            None => {
                locks.insert(
                    key,
                    Held {
                        lock: acquired,
                        holders: 1,
                    },
                );
            }
        }
        Ok(())
    }

    /// Release one hold on `path`; the OS lock goes away with the last hold.
    pub async fn unlock(&self, path: &Path) -> Result<()> {
        let key = canonical_key(path);
        let mut locks = self.inner.locks.lock().await;
        let Some(held) = locks.get_mut(&key) else {
            log::warn!("unlock of {} which is not held", key.display());
            return Ok(());
        };
        held.holders -= 1;
        if held.holders == 0 {
            if let Some(held) = locks.remove(&key) {
                drop(locks);
                held.lock.release().await?;
            }
        }
        self.inner.metrics.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run `f` while holding the lock for `path`, releasing afterwards even
    /// when `f` fails.
    pub async fn with_lock<T, F, Fut>(&self, path: &Path, opts: &LockOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.lock(path, opts).await?;
        let result = f().await;
        if let Err(e) = self.unlock(path).await {
            log::warn!("unlock failed for {}: {e}", path.display());
        }
        result
    }

    pub async fn held_count(&self) -> usize {
        self.inner.locks.lock().await.len()
    }

    pub async fn unlock_all(&self) {
        let mut locks = self.inner.locks.lock().await;
        for (path, held) in locks.drain() {
            if let Err(e) = held.lock.release().await {
                log::warn!("failed to release lock on {}: {e}", path.display());
            }
            self.inner.metrics.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> LockMetricsSnapshot {
        let m = &self.inner.metrics;
        let acquired = m.acquired.load(Ordering::Relaxed);
        let total_wait = m.total_wait_ms.load(Ordering::Relaxed);
        LockMetricsSnapshot {
            requests: m.requests.load(Ordering::Relaxed),
            acquired,
            conflicts: m.conflicts.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            released: m.released.load(Ordering::Relaxed),
            stale_cleared: m.stale_cleared.load(Ordering::Relaxed),
            avg_wait_ms: if acquired == 0 {
                0.0
            } else {
                total_wait as f64 / acquired as f64
            },
            max_wait_ms: m.max_wait_ms.load(Ordering::Relaxed),
        }
    }

    /// Register a directory for the background stale sweep.
    pub async fn watch_dir(&self, dir: &Path) {
        self.inner
            .sweep_dirs
            .lock()
            .await
            .insert(dir.to_path_buf());
    }

    /// Start the background sweep. Calling again replaces the previous task.
    pub async fn start_sweeper(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dirs: Vec<PathBuf> =
                    inner.sweep_dirs.lock().await.iter().cloned().collect();
                if dirs.is_empty() {
                    continue;
                }
                let own: HashSet<PathBuf> = inner
                    .locks
                    .lock()
                    .await
                    .keys()
                    .map(|k| paths::lock_sidecar_path(k))
                    .collect();
                let platform = Arc::clone(&inner.platform);
                let swept = tokio::task::spawn_blocking(move || {
                    sweep_dirs_sync(&dirs, &own, platform.as_ref())
                })
                .await
                .unwrap_or(0);
                if swept > 0 {
                    log::info!("cleared {swept} stale lock sidecar(s)");
                    inner
                        .metrics
                        .stale_cleared
                        .fetch_add(swept, Ordering::Relaxed);
                }
            }
        });
        let mut sweeper = self.inner.sweeper.lock().await;
        if let Some(old) = sweeper.replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweeper and release everything still held.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        self.unlock_all().await;
    }
}

fn sweep_dirs_sync(dirs: &[PathBuf], own: &HashSet<PathBuf>, platform: &dyn PlatformLock) -> u64 {
    let mut cleared = 0;
    for dir in dirs {
        for entry in WalkDir::new(dir).into_iter().flatten() {
            let path = entry.path();
            if !entry.file_type().is_file() || !paths::is_lock_sidecar(path) {
                continue;
            }
            if own.contains(path) {
                continue;
            }
            let stale = match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<LockInfo>(&bytes) {
                    Ok(info) => is_stale(&info, platform),
                    Err(_) => true,
                },
                Err(_) => continue,
            };
            if stale && std::fs::remove_file(path).is_ok() {
                log::debug!("swept stale lock {}", path.display());
                cleared += 1;
            }
        }
    }
    cleared
}

fn canonical_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reentrant_lock_is_deduplicated() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        let manager = LockManager::new();
        let opts = LockOptions::default();

        manager.lock(&target, &opts).await.expect("first");
        manager.lock(&target, &opts).await.expect("re-enter");
        assert_eq!(manager.held_count().await, 1);

        manager.unlock(&target).await.expect("unlock one");
        assert_eq!(manager.held_count().await, 1, "still held once");
        manager.unlock(&target).await.expect("unlock last");
        assert_eq!(manager.held_count().await, 0);

        let metrics = manager.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.acquired, 2);
        assert_eq!(metrics.released, 2);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        let manager = LockManager::new();

        let result: Result<()> = manager
            .with_lock(&target, &LockOptions::default(), || async {
                Err(StoreError::NoBackups {
                    path: target.clone(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.held_count().await, 0, "lock released after failure");
    }

    #[tokio::test]
    async fn sweeper_clears_expired_sidecars() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        let sidecar = paths::lock_sidecar_path(&target);

        let expired = LockInfo {
            pid: std::process::id(),
            hostname: "test".into(),
            lock_type: Default::default(),
            acquired_at_unix_ms: 1000,
            expires_at_unix_ms: 2000,
            process_name: None,
            user: None,
        };
        std::fs::write(&sidecar, serde_json::to_vec(&expired).expect("json")).expect("seed");

        let manager = LockManager::new();
        manager.watch_dir(dir.path()).await;
        manager.start_sweeper(Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sidecar.exists(), "expired sidecar swept");
        assert!(manager.metrics().stale_cleared >= 1);
        manager.shutdown().await;
    }
}
