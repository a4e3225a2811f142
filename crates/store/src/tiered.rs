//! Size-tiered reads and writes.
//!
//! Small documents go straight through [`AtomicStore`]. Larger documents use
//! chunked blocking I/O with a watchdog that samples RSS growth relative to
//! a baseline taken at operation start and aborts the operation when growth
//! crosses the configured limit. The abort surfaces as a recoverable
//! [`StoreError::MemoryLimit`], never a process kill.

use std::io::{Read, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::atomic::{spawn_io, AtomicStore, WriteOptions};
use crate::error::{Result, StoreError};
use crate::hash::{sha256_hex, sha256_hex_reader};
use crate::lock::{FileLock, LockOptions};
use crate::memory::current_rss_bytes;
use crate::paths;

/// Documents up to this size are read and written whole.
pub const SMALL_FILE_BYTES: u64 = 1024 * 1024;
/// Above this size the streaming path switches to larger chunks.
pub const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;

const STREAM_CHUNK: usize = 64 * 1024;
const LARGE_STREAM_CHUNK: usize = 256 * 1024;
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MEMORY_LIMIT: u64 = 50 * 1024 * 1024;

const READ_TARGET: Duration = Duration::from_secs(1);
const LARGE_READ_TARGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TieredOptions {
    /// Allowed RSS growth during one streamed operation, measured against a
    /// baseline sampled when the operation starts. Zero aborts immediately.
    pub memory_limit_bytes: u64,
    /// Accepted for forward compatibility; currently falls back to eager
    /// streaming.
    pub lazy_load: bool,
}

impl Default for TieredOptions {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
            lazy_load: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerfSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub avg_read_ms: f64,
    pub avg_write_ms: f64,
    pub peak_rss_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchReport {
    pub iterations: u32,
    pub avg: Duration,
    pub max: Duration,
    pub target: Duration,
    pub passed: bool,
}

#[derive(Default)]
struct Perf {
    reads: AtomicU64,
    writes: AtomicU64,
    total_read_us: AtomicU64,
    total_write_us: AtomicU64,
    peak_rss: AtomicU64,
}

/// Size-aware wrapper around [`AtomicStore`].
pub struct TieredStateManager {
    store: Arc<AtomicStore>,
    opts: TieredOptions,
    perf: Perf,
}

impl TieredStateManager {
    pub fn new(store: Arc<AtomicStore>, opts: TieredOptions) -> Self {
        if opts.lazy_load {
            log::debug!("lazy load requested; falling back to eager streaming");
        }
        Self {
            store,
            opts,
            perf: Perf::default(),
        }
    }

    pub fn store(&self) -> &AtomicStore {
        &self.store
    }

    pub async fn read_json<T>(&self, path: &Path) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let size = self.file_size(path).await?;
        let started = Instant::now();
        let value = if size <= SMALL_FILE_BYTES {
            self.store.read_json(path).await?
        } else {
            let chunk = if size > LARGE_FILE_BYTES {
                LARGE_STREAM_CHUNK
            } else {
                STREAM_CHUNK
            };
            self.read_streaming(path, chunk).await?
        };
        self.perf.reads.fetch_add(1, Ordering::Relaxed);
        self.perf
            .total_read_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(value)
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
        opts: &WriteOptions,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let started = Instant::now();
        let size = bytes.len() as u64;
        if size <= SMALL_FILE_BYTES {
            self.store.write_bytes(path, bytes, opts).await?;
        } else {
            let chunk = if size > LARGE_FILE_BYTES {
                LARGE_STREAM_CHUNK
            } else {
                STREAM_CHUNK
            };
            self.write_streaming(path, bytes, chunk, opts).await?;
        }
        self.perf.writes.fetch_add(1, Ordering::Relaxed);
        self.perf
            .total_write_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn read_streaming<T>(&self, path: &Path, chunk: usize) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (watchdog, abort, observed) = self.spawn_watchdog();
        let path_owned = path.to_path_buf();
        let abort_reader = Arc::clone(&abort);
        let result = spawn_io(move || {
            let file = std::fs::File::open(&path_owned)?;
            let reader = GuardedReader {
                inner: std::io::BufReader::with_capacity(chunk, file),
                abort: abort_reader,
            };
            serde_json::from_reader(reader)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .await;
        watchdog.abort();
        self.record_peak_rss();

        if abort.load(Ordering::Relaxed) {
            return Err(StoreError::MemoryLimit {
                observed_bytes: observed.load(Ordering::Relaxed),
                limit_bytes: self.opts.memory_limit_bytes,
            });
        }
        result
    }

    /// Streaming writes honor the same [`WriteOptions`] contract as the
    /// small tier: the sidecar lock when requested, and the git hook after
    /// a successful rename.
    async fn write_streaming(
        &self,
        path: &Path,
        bytes: Vec<u8>,
        chunk: usize,
        opts: &WriteOptions,
    ) -> Result<()> {
        let lock = if opts.lock {
            let lock_opts = LockOptions {
                timeout: opts.lock_timeout,
                ..Default::default()
            };
            Some(FileLock::acquire(path, &lock_opts, self.store.platform()).await?)
        } else {
            None
        };

        let result = self.write_streaming_locked(path, bytes, chunk, opts).await;

        if let Some(lock) = lock {
            if let Err(e) = lock.release().await {
                log::warn!("failed to release write lock on {}: {e}", path.display());
            }
        }
        result?;

        if let (Some(hook), Some(message)) = (self.store.git_hook(), &opts.git_commit_message) {
            if let Err(e) = hook.auto_version_on_write(path, message).await {
                log::warn!("git hook failed for {}: {e}", path.display());
            }
        }
        Ok(())
    }

    async fn write_streaming_locked(
        &self,
        path: &Path,
        bytes: Vec<u8>,
        chunk: usize,
        opts: &WriteOptions,
    ) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        if opts.backup && fs::try_exists(path).await? {
            fs::copy(path, paths::backup_path(path)).await?;
        }

        let expected_len = bytes.len() as u64;
        let checksum = sha256_hex(&bytes);
        let tmp = paths::tmp_path(path);

        let (watchdog, abort, observed) = self.spawn_watchdog();
        let tmp_owned = tmp.clone();
        let abort_writer = Arc::clone(&abort);
        let verify = opts.verify;
        let expected_checksum = checksum.clone();
        let result: Result<()> = spawn_io(move || {
            let mut file = std::io::BufWriter::with_capacity(chunk, std::fs::File::create(&tmp_owned)?);
            for piece in bytes.chunks(chunk) {
                if abort_writer.load(Ordering::Relaxed) {
                    return Err(std::io::Error::other("write aborted by memory watchdog"));
                }
                file.write_all(piece)?;
            }
            let file = file.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            if verify {
                let mut reread = std::fs::File::open(&tmp_owned)?;
                let (actual_checksum, actual_len) = sha256_hex_reader(&mut reread)?;
                if actual_len != expected_len || actual_checksum != expected_checksum {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "read-back verification failed",
                    ));
                }
            }
            Ok(())
        })
        .await;
        watchdog.abort();
        self.record_peak_rss();

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
            if abort.load(Ordering::Relaxed) {
                return Err(StoreError::MemoryLimit {
                    observed_bytes: observed.load(Ordering::Relaxed),
                    limit_bytes: self.opts.memory_limit_bytes,
                });
            }
            return result;
        }

        fs::rename(&tmp, path).await?;
        self.store.record_checksum(path, checksum);
        Ok(())
    }

    /// Watchdog over RSS growth. The baseline is sampled synchronously before
    /// any bytes move, so a zero allowance aborts deterministically and a
    /// process that is already large does not trip the limit on its own.
    fn spawn_watchdog(&self) -> (tokio::task::JoinHandle<()>, Arc<AtomicBool>, Arc<AtomicU64>) {
        let abort = Arc::new(AtomicBool::new(false));
        let growth = Arc::new(AtomicU64::new(0));
        let limit = self.opts.memory_limit_bytes;
        let baseline = current_rss_bytes();
        if baseline.is_some() && limit == 0 {
            log::warn!("memory watchdog tripped before start: zero growth allowance");
            abort.store(true, Ordering::Relaxed);
        }
        let abort_task = Arc::clone(&abort);
        let growth_task = Arc::clone(&growth);
        let handle = tokio::spawn(async move {
            // No sampling on this platform; limits fall to the caller.
            let Some(base) = baseline else { return };
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(rss) = current_rss_bytes() else { continue };
                let grown = rss.saturating_sub(base);
                growth_task.fetch_max(grown, Ordering::Relaxed);
                if grown >= limit {
                    log::warn!("memory watchdog tripped: grew {grown} bytes, limit {limit}");
                    abort_task.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });
        (handle, abort, growth)
    }

    fn record_peak_rss(&self) {
        if let Some(rss) = current_rss_bytes() {
            self.perf.peak_rss.fetch_max(rss, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> PerfSnapshot {
        let reads = self.perf.reads.load(Ordering::Relaxed);
        let writes = self.perf.writes.load(Ordering::Relaxed);
        PerfSnapshot {
            reads,
            writes,
            avg_read_ms: avg_ms(self.perf.total_read_us.load(Ordering::Relaxed), reads),
            avg_write_ms: avg_ms(self.perf.total_write_us.load(Ordering::Relaxed), writes),
            peak_rss_bytes: self.perf.peak_rss.load(Ordering::Relaxed),
        }
    }

    /// Repeatedly read `path` and compare against the fixed latency targets.
    pub async fn benchmark_read(&self, path: &Path, iterations: u32) -> Result<BenchReport> {
        let size = self.file_size(path).await?;
        let target = if size > LARGE_FILE_BYTES {
            LARGE_READ_TARGET
        } else {
            READ_TARGET
        };
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        for _ in 0..iterations.max(1) {
            let started = Instant::now();
            let _: serde_json::Value = self.read_json(path).await?;
            let elapsed = started.elapsed();
            total += elapsed;
            max = max.max(elapsed);
        }
        let avg = total / iterations.max(1);
        Ok(BenchReport {
            iterations: iterations.max(1),
            avg,
            max,
            target,
            passed: max <= target,
        })
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn avg_ms(total_us: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        (total_us as f64 / count as f64) / 1000.0
    }
}

struct GuardedReader<R> {
    inner: R,
    abort: Arc<AtomicBool>,
}

impl<R: Read> Read for GuardedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.abort.load(Ordering::Relaxed) {
            // Must not be `Interrupted`: std readers retry that kind, which
            // would spin forever instead of unwinding to the caller.
            return Err(std::io::Error::other("read aborted by memory watchdog"));
        }
        self.inner.read(buf)
    }
}
