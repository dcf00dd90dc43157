//! Configuration for the stitching stage.
//!
//! [`StitchConfig`] holds the per-run arguments given on the command line.
//! [`Settings`] holds environment tuning (object store, finalizer program,
//! statistics block size) and can be loaded from a YAML or JSON file.

use crate::error::{Result, StitchError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A blob given as `bucket:key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLocation {
    pub bucket: String,
    pub key: String,
}

impl DocumentLocation {
    /// Parse a `bucket:key` string. The key may itself contain `:`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.split_once(':') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(StitchError::config(format!(
                "Invalid document location '{}': expected 'bucket:path/in/bucket.json'",
                value
            ))),
        }
    }
}

impl std::str::FromStr for DocumentLocation {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DocumentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.key)
    }
}

/// Per-run arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Bucket holding the input raster, the tiles, the state and the output
    pub bucket: String,

    /// Key of the source raster in `bucket`
    pub infile: String,

    /// Key of the final raster in `bucket`
    pub outfile: String,

    /// Prefix the tiling stage saved the tiles with
    pub tile_prefix: String,

    /// Key of the preparation state in `bucket`
    pub state_key: String,

    /// Tile overlap in pixels
    pub overlap_size: u32,

    /// Aggregate statistics request document
    #[serde(default)]
    pub stats: Option<DocumentLocation>,

    /// Spatial statistics request document
    #[serde(default)]
    pub spatial_stats: Option<DocumentLocation>,

    /// Skip raster statistics, colour table and overviews
    #[serde(default)]
    pub skip_default_stats: bool,

    /// Leave tiles and documents in the bucket
    #[serde(default)]
    pub keep_intermediates: bool,

    /// Reader workers for the statistics engine
    #[serde(default)]
    pub stats_read_workers: usize,

    /// One timeout (seconds) for all four statistics buffer operations
    #[serde(default)]
    pub read_worker_timeouts: Option<u64>,

    /// Environment tuning
    #[serde(default)]
    pub settings: Settings,
}

impl StitchConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("bucket", &self.bucket),
            ("infile", &self.infile),
            ("outfile", &self.outfile),
            ("tileprefix", &self.tile_prefix),
            ("pickle", &self.state_key),
        ] {
            if value.is_empty() {
                return Err(StitchError::config(format!("--{} must not be empty", name)));
            }
        }
        if self.output_file_name().is_none() {
            return Err(StitchError::config(format!(
                "--outfile '{}' has no file name",
                self.outfile
            )));
        }
        if self.read_worker_timeouts == Some(0) {
            return Err(StitchError::config("Read worker timeouts must be > 0"));
        }
        if self.skip_default_stats && self.stats.is_some() {
            tracing::warn!("Per-segment statistics requested while default statistics are skipped");
        }
        self.settings.validate()
    }

    /// Concurrency passed to the statistics engine.
    pub fn concurrency_style(&self) -> ConcurrencyStyle {
        ConcurrencyStyle::from_options(self.stats_read_workers, self.read_worker_timeouts)
    }

    /// Final path component of the output key.
    pub fn output_file_name(&self) -> Option<&str> {
        Path::new(&self.outfile)
            .file_name()
            .and_then(|name| name.to_str())
    }
}

/// Buffer timeouts used when none are configured.
pub const DEFAULT_READ_BUFFER_INSERT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_BUFFER_POP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COMPUTE_BUFFER_INSERT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COMPUTE_BUFFER_POP_TIMEOUT: Duration = Duration::from_secs(20);

/// Reader pool size and buffer timeouts of the statistics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyStyle {
    /// Reader workers; 0 reads inline without buffers or timeouts
    pub num_read_workers: usize,
    pub read_buffer_insert_timeout: Duration,
    pub read_buffer_pop_timeout: Duration,
    pub compute_buffer_insert_timeout: Duration,
    pub compute_buffer_pop_timeout: Duration,
}

impl ConcurrencyStyle {
    /// Concurrency with the engine's default timeouts.
    pub fn new(num_read_workers: usize) -> Self {
        Self {
            num_read_workers,
            read_buffer_insert_timeout: DEFAULT_READ_BUFFER_INSERT_TIMEOUT,
            read_buffer_pop_timeout: DEFAULT_READ_BUFFER_POP_TIMEOUT,
            compute_buffer_insert_timeout: DEFAULT_COMPUTE_BUFFER_INSERT_TIMEOUT,
            compute_buffer_pop_timeout: DEFAULT_COMPUTE_BUFFER_POP_TIMEOUT,
        }
    }

    /// Concurrency with all four timeouts set to `timeout`.
    pub fn with_uniform_timeout(num_read_workers: usize, timeout: Duration) -> Self {
        Self {
            num_read_workers,
            read_buffer_insert_timeout: timeout,
            read_buffer_pop_timeout: timeout,
            compute_buffer_insert_timeout: timeout,
            compute_buffer_pop_timeout: timeout,
        }
    }

    pub fn from_options(num_read_workers: usize, timeout_secs: Option<u64>) -> Self {
        match timeout_secs {
            Some(secs) => Self::with_uniform_timeout(num_read_workers, Duration::from_secs(secs)),
            None => Self::new(num_read_workers),
        }
    }

    /// Whether blocks are read and reduced on one task with no buffers.
    pub fn reads_inline(&self) -> bool {
        self.num_read_workers == 0
    }
}

impl Default for ConcurrencyStyle {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Environment tuning, loadable from a settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Object store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// External finalization engine
    #[serde(default)]
    pub finalizer: FinalizerConfig,

    /// Statistics engine tuning
    #[serde(default)]
    pub stats: StatsConfig,

    /// Parent of the per-run temp directory (default: system temp dir)
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    /// Write the final metrics snapshot as JSON to this path
    #[serde(default)]
    pub metrics_output: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let settings = match ext {
            "json" => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
        };
        settings.map_err(|e| {
            StitchError::config(format!("Invalid settings file {}: {}", path.display(), e))
        })
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| StitchError::config(format!("Invalid settings: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.finalizer.program.is_empty() {
            return Err(StitchError::config("Finalizer program must not be empty"));
        }
        if self.stats.block_size == 0 {
            return Err(StitchError::config("Statistics block size must be > 0"));
        }
        if let Some(root) = &self.store.local_root {
            if !root.is_dir() {
                return Err(StitchError::config(format!(
                    "Local store root {} is not a directory",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Serve buckets from `local_root/<bucket>` instead of S3
    #[serde(default)]
    pub local_root: Option<PathBuf>,

    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// S3 connection settings. Credentials always come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region (default: from environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (for LocalStack, MinIO, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// External finalization program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizerConfig {
    /// Executable, looked up on PATH
    #[serde(default = "default_finalizer_program")]
    pub program: String,

    /// Arguments placed before the job file path
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            program: default_finalizer_program(),
            args: Vec::new(),
        }
    }
}

/// Statistics engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Side length of a read block in pixels
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

// Default value functions for serde
fn default_max_retries() -> usize { 5 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
fn default_finalizer_program() -> String { "tile-finalize".to_string() }
fn default_block_size() -> usize { 256 }
