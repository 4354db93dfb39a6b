//! Retention Cleaner
//!
//! Archived segments are kept around for a while after the roller retires
//! them (point-in-time tooling and replication may still want them). The
//! cleaner is the periodic chore that eventually deletes them.
//!
//! ## Policy
//!
//! Whether an archived segment may go is decided by a
//! [`LogCleanerDelegate`]. The default, [`TimeToLiveCleaner`], deletes a
//! segment once its modification time is older than the configured TTL.
//! Delegates are resolved by name through a [`DelegateRegistry`]; an
//! unknown name falls back to the TTL policy with a warning.
//!
//! ## Each pass
//!
//! - The archive directory is walked up to `max_depth` levels. Deeper
//!   directories are reported and left alone.
//! - Files whose name is not a valid segment name are deleted regardless of
//!   policy.
//! - At most `max_deletions_per_run` files are deleted, so a large backlog
//!   drains over several passes instead of one burst.
//! - A file that vanished between listing and deletion is not an error.
//!   Any other failed deletion is logged and retried on the next pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::segment::SegmentName;

/// Decides whether one archived segment may be deleted.
#[async_trait]
pub trait LogCleanerDelegate: Send + Sync {
    fn name(&self) -> &str;

    async fn is_segment_deletable(&self, path: &Path) -> bool;
}

/// Deletes segments whose modification time is older than `ttl`.
#[derive(Debug, Clone)]
pub struct TimeToLiveCleaner {
    ttl: Duration,
}

impl TimeToLiveCleaner {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl LogCleanerDelegate for TimeToLiveCleaner {
    fn name(&self) -> &str {
        "ttl"
    }

    async fn is_segment_deletable(&self, path: &Path) -> bool {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = ?path, error = %e, "Cannot read modification time");
                return false;
            }
        };
        // A modification time in the future reads as "not old enough"
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age > self.ttl,
            Err(_) => false,
        }
    }
}

/// Never deletes a well-formed segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllCleaner;

#[async_trait]
impl LogCleanerDelegate for KeepAllCleaner {
    fn name(&self) -> &str {
        "keep-all"
    }

    async fn is_segment_deletable(&self, _path: &Path) -> bool {
        false
    }
}

type DelegateFactory = Box<dyn Fn(&RetentionConfig) -> Arc<dyn LogCleanerDelegate> + Send + Sync>;

/// Maps policy names to delegate constructors.
pub struct DelegateRegistry {
    factories: HashMap<String, DelegateFactory>,
}

impl Default for DelegateRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("ttl", |config| Arc::new(TimeToLiveCleaner::new(config.ttl())));
        registry.register("keep-all", |_| Arc::new(KeepAllCleaner));
        registry
    }
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RetentionConfig) -> Arc<dyn LogCleanerDelegate> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// The delegate named by `config.policy`, or the TTL policy if no such
    /// name is registered.
    pub fn resolve(&self, config: &RetentionConfig) -> Arc<dyn LogCleanerDelegate> {
        match self.factories.get(&config.policy) {
            Some(factory) => factory(config),
            None => {
                warn!(
                    policy = %config.policy,
                    "Unknown log cleaner policy, defaulting to ttl"
                );
                Arc::new(TimeToLiveCleaner::new(config.ttl()))
            }
        }
    }
}

/// Outcome of one cleaner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanerStats {
    /// Regular files looked at
    pub scanned: usize,
    /// Files deleted, malformed ones included
    pub deleted: usize,
    /// Files deleted for not being valid segment names
    pub malformed: usize,
    /// Deletions that failed and will be retried next pass
    pub failed: usize,
    /// Directories skipped for exceeding `max_depth`
    pub too_deep: usize,
}

pub struct LogCleaner {
    archive_dir: PathBuf,
    config: RetentionConfig,
    delegate: Arc<dyn LogCleanerDelegate>,
}

impl LogCleaner {
    pub fn new(
        archive_dir: impl Into<PathBuf>,
        config: RetentionConfig,
        delegate: Arc<dyn LogCleanerDelegate>,
    ) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            config,
            delegate,
        }
    }

    /// Cleaner whose delegate is resolved from `config.policy` by the
    /// default registry.
    pub fn from_config(archive_dir: impl Into<PathBuf>, config: RetentionConfig) -> Self {
        let delegate = DelegateRegistry::default().resolve(&config);
        Self::new(archive_dir, config, delegate)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn delegate_name(&self) -> &str {
        self.delegate.name()
    }

    /// One pass over the archive directory.
    pub async fn run_once(&self) -> Result<CleanerStats> {
        let mut stats = CleanerStats::default();
        let budget = self.config.max_deletions_per_run;

        // (directory, levels of files it may still hold)
        let mut pending = vec![(self.archive_dir.clone(), self.config.max_depth)];

        while let Some((dir, depth_left)) = pending.pop() {
            if stats.deleted >= budget {
                break;
            }
            let mut listing = match tokio::fs::read_dir(&dir).await {
                Ok(listing) => listing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            while let Some(entry) = listing.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    subdirs.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
            if files.is_empty() && subdirs.is_empty() {
                continue;
            }
            if depth_left == 0 {
                warn!(dir = ?dir, "Archive directory structure is too deep, skipping");
                stats.too_deep += 1;
                continue;
            }

            files.sort();
            for path in files {
                if stats.deleted >= budget {
                    break;
                }
                stats.scanned += 1;
                self.clean_file(&path, &mut stats).await;
            }

            // Reverse so the stack pops subdirectories in name order
            subdirs.sort();
            pending.extend(subdirs.into_iter().rev().map(|d| (d, depth_left - 1)));
        }

        if stats.deleted > 0 || stats.failed > 0 {
            info!(
                dir = ?self.archive_dir,
                deleted = stats.deleted,
                malformed = stats.malformed,
                failed = stats.failed,
                "Archived segments cleaned"
            );
        }
        Ok(stats)
    }

    async fn clean_file(&self, path: &Path, stats: &mut CleanerStats) {
        let malformed = SegmentName::from_path(path).is_none();
        if malformed {
            warn!(path = ?path, "Found a wrongly formatted file in the archive, deleting");
        } else if !self.delegate.is_segment_deletable(path).await {
            return;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                stats.deleted += 1;
                if malformed {
                    stats.malformed += 1;
                }
                debug!(path = ?path, policy = self.delegate.name(), "Deleted archived file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "Archived file already gone");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(path = ?path, error = %e, "Failed to delete archived file");
            }
        }
    }

    pub fn spawn(self, period: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(period, shutdown))
    }

    /// Run a pass every `period` until `shutdown` changes or its sender is
    /// dropped.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            dir = ?self.archive_dir,
            policy = self.delegate.name(),
            period_ms = period.as_millis() as u64,
            "Log cleaner started"
        );

        let mut total_deleted: usize = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    info!("Log cleaner received shutdown signal");
                    break;
                }
            }

            match self.run_once().await {
                Ok(stats) => total_deleted += stats.deleted,
                Err(e) => error!(error = %e, "Error while cleaning archived segments"),
            }
        }

        info!(total_deleted, "Log cleaner stopped");
    }
}
