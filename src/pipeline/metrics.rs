//! Run metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for one stitching run.
#[derive(Debug, Default)]
pub struct StitchMetrics {
    /// Bytes of state and request documents downloaded
    pub bytes_downloaded: AtomicU64,

    /// Bytes of the published output
    pub bytes_uploaded: AtomicU64,

    /// Tile keys resolved from the preparation state
    pub tiles_resolved: AtomicU64,

    /// Delete requests issued
    pub delete_batches: AtomicU64,

    /// Keys deleted
    pub keys_deleted: AtomicU64,

    /// Aggregate and spatial statistics tasks completed
    pub stats_tasks: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent in the finalization engine
    pub finalize_us: AtomicU64,

    /// Time spent on default raster statistics, colour table and overviews
    pub default_stats_us: AtomicU64,

    /// Time spent in the statistics engine
    pub stats_us: AtomicU64,

    /// Time spent uploading the output
    pub upload_us: AtomicU64,

    /// Time spent deleting intermediates
    pub cleanup_us: AtomicU64,
}

impl StitchMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_tiles_resolved(&self, count: u64) {
        self.tiles_resolved.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a finished purge.
    pub fn add_deleted(&self, batches: u64, keys: u64) {
        self.delete_batches.fetch_add(batches, Ordering::Relaxed);
        self.keys_deleted.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn add_stats_task(&self) {
        self.stats_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_finalize_time(&self, duration: Duration) {
        self.finalize_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_default_stats_time(&self, duration: Duration) {
        self.default_stats_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_stats_time(&self, duration: Duration) {
        self.stats_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_upload_time(&self, duration: Duration) {
        self.upload_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_cleanup_time(&self, duration: Duration) {
        self.cleanup_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            tiles_resolved: self.tiles_resolved.load(Ordering::Relaxed),
            delete_batches: self.delete_batches.load(Ordering::Relaxed),
            keys_deleted: self.keys_deleted.load(Ordering::Relaxed),
            stats_tasks: self.stats_tasks.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            finalize_secs: secs(&self.finalize_us),
            default_stats_secs: secs(&self.default_stats_us),
            stats_secs: secs(&self.stats_us),
            upload_secs: secs(&self.upload_us),
            cleanup_secs: secs(&self.cleanup_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub tiles_resolved: u64,
    pub delete_batches: u64,
    pub keys_deleted: u64,
    pub stats_tasks: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub finalize_secs: f64,
    pub default_stats_secs: f64,
    pub stats_secs: f64,
    pub upload_secs: f64,
    pub cleanup_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::StitchError::config(format!("metrics: {}", e)))?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tiles: {} | Deleted: {} keys in {} batches | Stats tasks: {} | \
             Uploaded: {:.2} MB | Elapsed: {:.1}s | \
             Time: finalize {:.1}s, default stats {:.1}s, stats {:.1}s, upload {:.1}s, cleanup {:.1}s",
            self.tiles_resolved,
            self.keys_deleted,
            self.delete_batches,
            self.stats_tasks,
            self.bytes_uploaded as f64 / (1024.0 * 1024.0),
            self.elapsed.as_secs_f64(),
            self.finalize_secs,
            self.default_stats_secs,
            self.stats_secs,
            self.upload_secs,
            self.cleanup_secs,
        )
    }
}

/// Peak resident set size of this process in kilobytes.
#[cfg(unix)]
pub fn peak_rss_kb() -> u64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct
    let rv = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rv != 0 {
        return 0;
    }
    // SAFETY: initialised by the successful call above
    let usage = unsafe { usage.assume_init() };
    let max_rss = usage.ru_maxrss.max(0) as u64;
    // macOS reports bytes, Linux kilobytes
    if cfg!(target_os = "macos") {
        max_rss / 1024
    } else {
        max_rss
    }
}

#[cfg(not(unix))]
pub fn peak_rss_kb() -> u64 {
    0
}
