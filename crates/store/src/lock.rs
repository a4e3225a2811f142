//! Cross-process advisory file locking.
//!
//! Each lock is a hidden JSON sidecar (`.<name>.lock`) describing the owner,
//! plus an OS advisory lock on the sidecar itself. A sidecar is stale when
//! its TTL has expired or its owning process is gone; either condition alone
//! is enough to reclaim it. OS syscalls run on the blocking pool.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::atomic::spawn_io;
use crate::error::{Result, StoreError};
use crate::paths;

use waypoint_model::now_unix_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    Exclusive,
    Shared,
}

/// Owner record stored in the lock sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    #[serde(default)]
    pub lock_type: LockType,
    pub acquired_at_unix_ms: u64,
    pub expires_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl LockInfo {
    fn for_current_process(lock_type: LockType, ttl: Duration) -> Self {
        let now = now_unix_ms();
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            lock_type,
            acquired_at_unix_ms: now,
            expires_at_unix_ms: now + ttl.as_millis() as u64,
            process_name: std::env::current_exe()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_unix_ms() >= self.expires_at_unix_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Available,
    Held,
    Blocked,
    Stale,
    Error,
}

/// Result of probing or acquiring a lock.
#[derive(Debug, Clone)]
pub struct LockOutcome {
    pub status: LockStatus,
    pub info: Option<LockInfo>,
    pub attempts: u32,
    pub waited: Duration,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_delay: Duration,
    /// Sidecar lifetime; a holder must refresh before this elapses.
    pub ttl: Duration,
    /// Fail immediately on contention instead of retrying. Internal races
    /// (a stale sidecar reclaimed mid-attempt) still get up to three tries
    /// before giving up.
    pub non_blocking: bool,
    pub lock_type: LockType,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
            ttl: Duration::from_secs(300),
            non_blocking: false,
            lock_type: LockType::Exclusive,
        }
    }
}

/// OS-level lock capability, separated so platform quirks stay in one place
/// and tests can substitute a fake.
pub trait PlatformLock: Send + Sync {
    fn try_lock(&self, file: &std::fs::File, lock_type: LockType) -> std::io::Result<bool>;
    fn unlock(&self, file: &std::fs::File) -> std::io::Result<()>;
    /// Whether a PID refers to a live process on this host. Platforms without
    /// a liveness probe return `true`, leaving staleness to the TTL.
    fn process_exists(&self, pid: u32) -> bool;
}

/// Default backend: `fs2` advisory locks + signal-0 liveness on Unix.
pub struct Fs2Lock;

impl PlatformLock for Fs2Lock {
    fn try_lock(&self, file: &std::fs::File, lock_type: LockType) -> std::io::Result<bool> {
        // Called through the trait; std has inherent `File::try_lock_shared`
        // with a different error type since 1.89.
        let result = match lock_type {
            LockType::Exclusive => FileExt::try_lock_exclusive(file),
            LockType::Shared => FileExt::try_lock_shared(file),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unlock(&self, file: &std::fs::File) -> std::io::Result<()> {
        FileExt::unlock(file)
    }

    #[cfg(unix)]
    fn process_exists(&self, pid: u32) -> bool {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn process_exists(&self, _pid: u32) -> bool {
        true
    }
}

pub(crate) fn is_stale(info: &LockInfo, platform: &dyn PlatformLock) -> bool {
    if info.is_expired() {
        return true;
    }
    // Liveness is only meaningful for locks taken on this host.
    info.hostname == hostname() && !platform.process_exists(info.pid)
}

enum Attempt {
    Acquired(std::fs::File, LockInfo),
    Busy(LockInfo),
    Raced,
}

fn attempt_sync(
    sidecar: &Path,
    info: LockInfo,
    platform: &dyn PlatformLock,
) -> std::io::Result<Attempt> {
    match std::fs::read(sidecar) {
        Ok(bytes) => match serde_json::from_slice::<LockInfo>(&bytes) {
            Ok(existing) => {
                if is_stale(&existing, platform) {
                    log::warn!(
                        "reclaiming stale lock {} (pid {}, expired: {})",
                        sidecar.display(),
                        existing.pid,
                        existing.is_expired()
                    );
                    let _ = std::fs::remove_file(sidecar);
                    return Ok(Attempt::Raced);
                }
                return Ok(Attempt::Busy(existing));
            }
            Err(_) => {
                // Unparseable sidecar counts as stale.
                log::warn!("reclaiming unparseable lock {}", sidecar.display());
                let _ = std::fs::remove_file(sidecar);
                return Ok(Attempt::Raced);
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(sidecar)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(Attempt::Raced),
        Err(e) => return Err(e),
    };
    if !platform.try_lock(&file, info.lock_type)? {
        drop(file);
        let _ = std::fs::remove_file(sidecar);
        return Ok(Attempt::Raced);
    }
    let bytes = serde_json::to_vec_pretty(&info)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(Attempt::Acquired(file, info))
}

/// An acquired cross-process lock. Release explicitly; `Drop` is a
/// best-effort fallback.
pub struct FileLock {
    target: PathBuf,
    sidecar: PathBuf,
    file: Option<std::fs::File>,
    info: LockInfo,
    platform: Arc<dyn PlatformLock>,
    attempts: u32,
    waited: Duration,
}

impl FileLock {
    pub async fn acquire(
        target: &Path,
        opts: &LockOptions,
        platform: Arc<dyn PlatformLock>,
    ) -> Result<FileLock> {
        let sidecar = paths::lock_sidecar_path(target);
        if let Some(parent) = sidecar.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        let max_attempts = if opts.non_blocking { 3 } else { u32::MAX };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let info = LockInfo::for_current_process(opts.lock_type, opts.ttl);
            let sidecar_clone = sidecar.clone();
            let platform_clone = Arc::clone(&platform);
            let outcome = spawn_io(move || {
                attempt_sync(&sidecar_clone, info, platform_clone.as_ref())
            })
            .await?;

            match outcome {
                Attempt::Acquired(file, info) => {
                    log::debug!(
                        "acquired lock on {} after {} attempt(s)",
                        target.display(),
                        attempts
                    );
                    return Ok(FileLock {
                        target: target.to_path_buf(),
                        sidecar,
                        file: Some(file),
                        info,
                        platform,
                        attempts,
                        waited: started.elapsed(),
                    });
                }
                Attempt::Busy(owner) => {
                    if opts.non_blocking {
                        return Err(StoreError::LockConflict {
                            path: target.to_path_buf(),
                            owner_pid: owner.pid,
                            suggestion: Some(conflict_suggestion(&owner)),
                        });
                    }
                }
                Attempt::Raced => {}
            }

            if attempts >= max_attempts || started.elapsed() >= opts.timeout {
                return Err(StoreError::LockTimeout {
                    path: target.to_path_buf(),
                    attempts,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(opts.retry_delay).await;
        }
    }

    /// Inspect a lock without acquiring it.
    pub async fn probe(target: &Path, platform: Arc<dyn PlatformLock>) -> LockOutcome {
        let sidecar = paths::lock_sidecar_path(target);
        let bytes = match tokio::fs::read(&sidecar).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return outcome(LockStatus::Available, None, None);
            }
            Err(e) => {
                return outcome(
                    LockStatus::Error,
                    None,
                    Some(format!("cannot read lock sidecar: {e}")),
                );
            }
        };
        match serde_json::from_slice::<LockInfo>(&bytes) {
            Ok(info) if is_stale(&info, platform.as_ref()) => {
                outcome(LockStatus::Stale, Some(info), None)
            }
            Ok(info) if info.pid == std::process::id() && info.hostname == hostname() => {
                outcome(LockStatus::Held, Some(info), None)
            }
            Ok(info) => {
                let suggestion = conflict_suggestion(&info);
                outcome(LockStatus::Blocked, Some(info), Some(suggestion))
            }
            Err(_) => outcome(LockStatus::Stale, None, None),
        }
    }

    /// Extend the TTL of a held lock in place.
    pub async fn refresh(&mut self, ttl: Duration) -> Result<()> {
        self.info.expires_at_unix_ms = now_unix_ms() + ttl.as_millis() as u64;
        let bytes = serde_json::to_vec_pretty(&self.info)?;
        // The OS lock lives on the original fd; rewriting through a second
        // handle does not drop it.
        tokio::fs::write(&self.sidecar, bytes).await?;
        Ok(())
    }

    pub async fn release(mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let sidecar = self.sidecar.clone();
        let platform = Arc::clone(&self.platform);
        spawn_io(move || {
            platform.unlock(&file)?;
            drop(file);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn outcome(&self) -> LockOutcome {
        LockOutcome {
            status: LockStatus::Held,
            info: Some(self.info.clone()),
            attempts: self.attempts,
            waited: self.waited,
            suggestion: None,
        }
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("target", &self.target)
            .field("sidecar", &self.sidecar)
            .field("info", &self.info)
            .field("attempts", &self.attempts)
            .field("waited", &self.waited)
            .finish_non_exhaustive()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = self.platform.unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(&self.sidecar);
        }
    }
}

fn outcome(status: LockStatus, info: Option<LockInfo>, suggestion: Option<String>) -> LockOutcome {
    LockOutcome {
        status,
        info,
        attempts: 0,
        waited: Duration::ZERO,
        suggestion,
    }
}

fn conflict_suggestion(owner: &LockInfo) -> String {
    format!(
        "held by {} (pid {}) on {}; retry later or wait for expiry",
        owner.process_name.as_deref().unwrap_or("unknown process"),
        owner.pid,
        owner.hostname
    )
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".to_string()
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn platform() -> Arc<dyn PlatformLock> {
        Arc::new(Fs2Lock)
    }

    #[test]
    fn platform_backend_handles_both_lock_modes() {
        let dir = TempDir::new().expect("tempdir");
        let file = std::fs::File::create(dir.path().join("target")).expect("create");
        let backend = Fs2Lock;

        assert!(backend.try_lock(&file, LockType::Shared).expect("shared"));
        backend.unlock(&file).expect("unlock shared");
        assert!(backend.try_lock(&file, LockType::Exclusive).expect("exclusive"));
        backend.unlock(&file).expect("unlock exclusive");
    }

    #[tokio::test]
    async fn acquire_and_release_cleans_up_sidecar() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");

        let lock = FileLock::acquire(&target, &LockOptions::default(), platform())
            .await
            .expect("acquire");
        let sidecar = paths::lock_sidecar_path(&target);
        assert!(sidecar.exists(), "sidecar present while held");

        lock.release().await.expect("release");
        assert!(!sidecar.exists(), "sidecar removed after release");
    }

    #[tokio::test]
    async fn expired_sidecar_is_reclaimed() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        let sidecar = paths::lock_sidecar_path(&target);

        let expired = LockInfo {
            pid: std::process::id(),
            hostname: hostname(),
            lock_type: LockType::Exclusive,
            acquired_at_unix_ms: 1000,
            expires_at_unix_ms: 2000,
            process_name: None,
            user: None,
        };
        std::fs::write(&sidecar, serde_json::to_vec(&expired).expect("json")).expect("seed");

        let lock = FileLock::acquire(&target, &LockOptions::default(), platform())
            .await
            .expect("stale lock must be reclaimable");
        assert!(lock.info().expires_at_unix_ms > now_unix_ms());
        lock.release().await.expect("release");
    }

    #[tokio::test]
    async fn unparseable_sidecar_counts_as_stale() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        std::fs::write(paths::lock_sidecar_path(&target), b"not json at all").expect("seed");

        let lock = FileLock::acquire(&target, &LockOptions::default(), platform())
            .await
            .expect("acquire over garbage sidecar");
        lock.release().await.expect("release");
    }

    #[tokio::test]
    async fn non_blocking_conflict_reports_owner() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");
        let sidecar = paths::lock_sidecar_path(&target);

        // Live lock owned by this process, far from expiry.
        let held = LockInfo::for_current_process(LockType::Exclusive, Duration::from_secs(300));
        std::fs::write(&sidecar, serde_json::to_vec(&held).expect("json")).expect("seed");

        let opts = LockOptions {
            non_blocking: true,
            ..Default::default()
        };
        let err = FileLock::acquire(&target, &opts, platform())
            .await
            .expect_err("must conflict");
        match err {
            StoreError::LockConflict { owner_pid, .. } => {
                assert_eq!(owner_pid, std::process::id());
            }
            other => panic!("expected LockConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_reports_available_then_blocked() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");

        let probe = FileLock::probe(&target, platform()).await;
        assert_eq!(probe.status, LockStatus::Available);

        let mut owner = LockInfo::for_current_process(LockType::Exclusive, Duration::from_secs(300));
        owner.pid = owner.pid.wrapping_add(1); // someone else
        std::fs::write(
            paths::lock_sidecar_path(&target),
            serde_json::to_vec(&owner).expect("json"),
        )
        .expect("seed");

        let probe = FileLock::probe(&target, platform()).await;
        // Another-pid sidecar is either blocked (pid alive) or stale (dead).
        assert!(matches!(probe.status, LockStatus::Blocked | LockStatus::Stale));
    }

    #[tokio::test]
    async fn refresh_extends_expiry() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("state.json");

        let mut lock = FileLock::acquire(&target, &LockOptions::default(), platform())
            .await
            .expect("acquire");
        let before = lock.info().expires_at_unix_ms;
        lock.refresh(Duration::from_secs(900)).await.expect("refresh");
        assert!(lock.info().expires_at_unix_ms > before);

        let on_disk: LockInfo = serde_json::from_slice(
            &std::fs::read(paths::lock_sidecar_path(&target)).expect("read"),
        )
        .expect("parse");
        assert_eq!(on_disk.expires_at_unix_ms, lock.info().expires_at_unix_ms);
        lock.release().await.expect("release");
    }
}
