//! # Config - datadb tuning knobs
//!
//! Holds the settings a partition engine needs at runtime. Values come from
//! [`Default`], builder-style setters, or environment variables:
//!
//! ```text
//! SILT_FLUSH_INTERVAL_MS  in-memory part flush interval   (default: 1000)
//! SILT_ALLOWED_MEMORY_MB  memory budget for parts         (default: 1024)
//! SILT_MERGE_WORKERS      merge workers per partition     (default: max(4, CPUs))
//! SILT_GLOBAL_MERGES      concurrent merges per process   (default: max(4, CPUs))
//! SILT_MIN_FREE_DISK_MB   disk space merges must leave    (default: 10)
//! SILT_FORMAT_VERSION     part format version to write    (default: 1)
//! ```

use anyhow::{ensure, Context, Result};
use std::time::Duration;

/// Latest on-disk part format version.
pub const LATEST_FORMAT_VERSION: u32 = 1;

/// Maximum number of in-memory parts a partition keeps before ingestion is
/// throttled.
pub const MAX_INMEMORY_PARTS_PER_PARTITION: u64 = 20;

/// Lower bound for the in-memory part size limit.
const MIN_INMEMORY_PART_SIZE: u64 = 1_000_000;

/// Runtime configuration for a single partition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatadbConfig {
    /// How long a freshly ingested in-memory part may stay in memory before
    /// the flusher writes it to disk (default: 1s).
    pub flush_interval: Duration,

    /// Memory the process may spend on in-memory parts (default: 1 GiB).
    pub allowed_memory_bytes: u64,

    /// Background merge workers per partition (default: max(4, CPUs)).
    pub merge_workers: usize,

    /// Concurrent merges across all partitions of the process
    /// (default: max(4, CPUs)). Only the first opened partition's value is
    /// used, since the limit is process-wide.
    pub global_merge_concurrency: usize,

    /// Free disk space merges must never consume (default: 10 MB).
    pub min_free_disk_space_bytes: u64,

    /// Part format version written by this process (default: latest).
    pub format_version: u32,
}

impl Default for DatadbConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            allowed_memory_bytes: 1024 * 1024 * 1024,
            merge_workers: default_merge_workers(),
            global_merge_concurrency: default_merge_workers(),
            min_free_disk_space_bytes: 10 * 1024 * 1024,
            format_version: LATEST_FORMAT_VERSION,
        }
    }
}

impl DatadbConfig {
    /// Set the in-memory part flush interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the memory budget used to size in-memory parts.
    pub fn allowed_memory_bytes(mut self, bytes: u64) -> Self {
        self.allowed_memory_bytes = bytes;
        self
    }

    /// Set the number of merge workers per partition.
    pub fn merge_workers(mut self, workers: usize) -> Self {
        self.merge_workers = workers;
        self
    }

    /// Set the process-wide merge concurrency.
    pub fn global_merge_concurrency(mut self, n: usize) -> Self {
        self.global_merge_concurrency = n;
        self
    }

    /// Set the free disk space merges must leave untouched.
    pub fn min_free_disk_space_bytes(mut self, bytes: u64) -> Self {
        self.min_free_disk_space_bytes = bytes;
        self
    }

    /// Set the part format version to write.
    pub fn format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }

    /// Largest merge output that may stay in memory.
    ///
    /// 10% of the allowed memory is shared by up to
    /// [`MAX_INMEMORY_PARTS_PER_PARTITION`] parts.
    #[must_use]
    pub fn max_inmemory_part_size(&self) -> u64 {
        let n = (self.allowed_memory_bytes as f64 * 0.1) as u64 / MAX_INMEMORY_PARTS_PER_PARTITION;
        n.max(MIN_INMEMORY_PART_SIZE)
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.flush_interval.is_zero(), "flush_interval must be > 0");
        ensure!(self.merge_workers > 0, "merge_workers must be > 0");
        ensure!(
            self.global_merge_concurrency > 0,
            "global_merge_concurrency must be > 0"
        );
        ensure!(
            self.format_version <= LATEST_FORMAT_VERSION,
            "unsupported format_version {}; latest is {}",
            self.format_version,
            LATEST_FORMAT_VERSION
        );
        Ok(())
    }

    /// Builds a config from `SILT_*` environment variables, falling back to
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unset keys keep their
    /// default; malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SILT_FLUSH_INTERVAL_MS")? {
            cfg.flush_interval = Duration::from_millis(ms);
        }
        if let Some(mb) = parse_var::<u64, _>(&lookup, "SILT_ALLOWED_MEMORY_MB")? {
            cfg.allowed_memory_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(n) = parse_var(&lookup, "SILT_MERGE_WORKERS")? {
            cfg.merge_workers = n;
        }
        if let Some(n) = parse_var(&lookup, "SILT_GLOBAL_MERGES")? {
            cfg.global_merge_concurrency = n;
        }
        if let Some(mb) = parse_var::<u64, _>(&lookup, "SILT_MIN_FREE_DISK_MB")? {
            cfg.min_free_disk_space_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(v) = parse_var(&lookup, "SILT_FORMAT_VERSION")? {
            cfg.format_version = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Default merge worker count: `max(4, available CPUs)`.
#[must_use]
pub fn default_merge_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let v = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value {:?} for {}", raw, key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}
