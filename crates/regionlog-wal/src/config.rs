//! WAL Configuration
//!
//! Values that control the writer, rolling, splitting and retention. Nothing
//! here reads files or environment variables; callers build these structs
//! (or deserialize them from whatever format they like) and pass them in.
//!
//! ## WalConfig
//!
//! - **log_dir**: directory holding the open segment and closed, unarchived ones
//! - **archive_dir**: where obsolete segments are moved on roll
//! - **sync_policy**: when group commits fsync (default: every 1s)
//! - **batch_max_records / batch_max_bytes / batch_max_age_ms**: thresholds
//!   that flush buffered appends without an explicit `sync`
//! - **roll_size_bytes / roll_period_ms**: when `needs_roll` reports true
//!   (default: 60MB / 1 hour)
//! - **max_active_segments**: above this many live segments, `regions_to_flush`
//!   starts naming regions to force-flush (default: 32)
//!
//! ## RetentionConfig
//!
//! Drives the archive cleaner: TTL of archived segments (default: 10 min),
//! deletions per run (default: 20), recursion depth (default: 2).
//!
//! ## SplitConfig
//!
//! Segments read per batch (default: 3) and concurrent output writers
//! (default: 3).
//!
//! ## Usage
//!
//! ```ignore
//! use regionlog_wal::{SyncPolicy, WalConfig};
//!
//! let config = WalConfig {
//!     log_dir: "/data/wal/server-1".into(),
//!     archive_dir: "/data/wal/.oldlogs".into(),
//!     sync_policy: SyncPolicy::Always,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Writer / roller
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory for live segments
    pub log_dir: PathBuf,

    /// Directory archived segments are moved into
    pub archive_dir: PathBuf,

    /// Segment file name prefix (default: "wal")
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Archive into `archive_dir/<file_prefix>/` instead of `archive_dir/`
    #[serde(default)]
    pub archive_use_subdir: bool,

    /// Sync policy for group commits
    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Buffered appends that trigger a flush (default: 1000)
    #[serde(default = "default_batch_max_records")]
    pub batch_max_records: usize,

    /// Buffered bytes that trigger a flush (default: 1MB)
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Oldest buffered append before a flush, in milliseconds (default: 10ms)
    #[serde(default = "default_batch_max_age_ms")]
    pub batch_max_age_ms: u64,

    /// Segment size that makes `needs_roll` true (default: 60MB)
    #[serde(default = "default_roll_size_bytes")]
    pub roll_size_bytes: u64,

    /// Segment age that makes `needs_roll` true, in milliseconds (default: 1 hour)
    #[serde(default = "default_roll_period_ms")]
    pub roll_period_ms: u64,

    /// How often the background roller checks `needs_roll` (default: 10s)
    #[serde(default = "default_roll_check_interval_ms")]
    pub roll_check_interval_ms: u64,

    /// Live segment count above which regions are asked to flush (default: 32)
    #[serde(default = "default_max_active_segments")]
    pub max_active_segments: usize,

    /// Capacity of the writer command channel (default: 16384)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_file_prefix() -> String {
    "wal".to_string()
}

fn default_batch_max_records() -> usize {
    1000
}

fn default_batch_max_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_batch_max_age_ms() -> u64 {
    10
}

fn default_roll_size_bytes() -> u64 {
    60 * 1024 * 1024 // 60MB
}

fn default_roll_period_ms() -> u64 {
    60 * 60 * 1000 // 1 hour
}

fn default_roll_check_interval_ms() -> u64 {
    10_000
}

fn default_max_active_segments() -> usize {
    32
}

fn default_channel_capacity() -> usize {
    16_384
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/wal"),
            archive_dir: PathBuf::from("./data/wal-archive"),
            file_prefix: default_file_prefix(),
            archive_use_subdir: false,
            sync_policy: SyncPolicy::default(),
            batch_max_records: default_batch_max_records(),
            batch_max_bytes: default_batch_max_bytes(),
            batch_max_age_ms: default_batch_max_age_ms(),
            roll_size_bytes: default_roll_size_bytes(),
            roll_period_ms: default_roll_period_ms(),
            roll_check_interval_ms: default_roll_check_interval_ms(),
            max_active_segments: default_max_active_segments(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WalConfig {
    /// Config rooted at `base`, with `base/logs` and `base/archive`.
    pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            log_dir: base.join("logs"),
            archive_dir: base.join("archive"),
            ..Default::default()
        }
    }

    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.batch_max_age_ms)
    }

    pub fn roll_period(&self) -> Duration {
        Duration::from_millis(self.roll_period_ms)
    }

    pub fn roll_check_interval(&self) -> Duration {
        Duration::from_millis(self.roll_check_interval_ms)
    }

    /// Directory a closed segment is archived into.
    pub fn archive_target_dir(&self) -> PathBuf {
        if self.archive_use_subdir {
            self.archive_dir.join(&self.file_prefix)
        } else {
            self.archive_dir.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_prefix.is_empty() || self.file_prefix.contains(['.', '/', '\\']) {
            return Err(Error::Config(format!(
                "file_prefix {:?} must be non-empty and contain no '.' or path separators",
                self.file_prefix
            )));
        }
        if self.log_dir == self.archive_dir {
            return Err(Error::Config(
                "log_dir and archive_dir must differ".to_string(),
            ));
        }
        if self.batch_max_records == 0 {
            return Err(Error::Config("batch_max_records must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be > 0".to_string()));
        }
        if let SyncPolicy::Interval { interval } = self.sync_policy {
            if interval.is_zero() {
                return Err(Error::Config("sync interval must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Sync policy for group commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync on every flush of the buffer
    Always,

    /// fsync on explicit sync and at least every `interval`
    Interval {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },

    /// Write to the OS only; fsync happens just for `sync(true)` and rolls
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Interval {
            interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Cleaner policy name; unknown names fall back to "ttl"
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Minimum age of an archived segment before the TTL policy deletes it
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Files deleted per run at most (default: 20)
    #[serde(default = "default_max_deletions_per_run")]
    pub max_deletions_per_run: usize,

    /// Directory levels descended below the archive root (default: 2)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Period of the cleaner chore (default: 1 min)
    #[serde(default = "default_cleaner_period_ms")]
    pub period_ms: u64,
}

fn default_policy() -> String {
    "ttl".to_string()
}

fn default_ttl_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_max_deletions_per_run() -> usize {
    20
}

fn default_max_depth() -> usize {
    2
}

fn default_cleaner_period_ms() -> u64 {
    60_000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            ttl_ms: default_ttl_ms(),
            max_deletions_per_run: default_max_deletions_per_run(),
            max_depth: default_max_depth(),
            period_ms: default_cleaner_period_ms(),
        }
    }
}

impl RetentionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

// ============================================================================
// Split
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Source segments read before per-region buffers are written out
    #[serde(default = "default_split_batch_size")]
    pub batch_size: usize,

    /// Concurrent per-region output writers
    #[serde(default = "default_split_writers")]
    pub writers: usize,

    /// Move fully split source segments here afterwards
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

fn default_split_batch_size() -> usize {
    3
}

fn default_split_writers() -> usize {
    3
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            batch_size: default_split_batch_size(),
            writers: default_split_writers(),
            archive_dir: None,
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
