//! Log Roller
//!
//! Keeps the list of closed segments that are still in the log directory
//! and moves them to the archive once no region needs them for recovery.
//!
//! ## Archival rule
//!
//! Closed segments are archived strictly oldest-first. A segment is obsolete
//! when its highest sequence id is below the oldest unflushed sequence id of
//! every region (or no region has unflushed edits). The first segment that
//! is not obsolete stops the scan, so the live set is always a contiguous
//! run of the newest segments.
//!
//! Immediately before each move every region with edits in the segment is
//! re-checked against its flush point. A failed check is logged as an
//! `ArchivalInvariantViolation` and the segment stays where it is.
//!
//! ## Background rolling
//!
//! [`LogRoller`] polls `Wal::needs_roll` on an interval and rolls when the
//! open segment is too large or too old. It stops when its shutdown signal
//! fires.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::segment::{compute_filename, LogSegment, SegmentName};
use crate::tracker::{regions_with_unflushed_edits_older_than, SequenceTracker};
use crate::wal::Wal;

#[derive(Debug)]
pub(crate) struct Roller {
    archive_dir: PathBuf,
    closed: VecDeque<LogSegment>,
}

impl Roller {
    pub(crate) fn new(archive_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            closed: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, segment: LogSegment) {
        self.closed.push_back(segment);
    }

    /// Closed segments not yet archived.
    pub(crate) fn len(&self) -> usize {
        self.closed.len()
    }

    pub(crate) fn closed_paths(&self) -> Vec<PathBuf> {
        self.closed.iter().map(|s| s.path.clone()).collect()
    }

    /// Archive the obsolete prefix of the closed list.
    pub(crate) async fn archive_obsolete(&mut self, tracker: &SequenceTracker) -> Result<Vec<PathBuf>> {
        let oldest_unflushed = tracker.oldest_unflushed();
        let mut archived = Vec::new();

        while let Some(segment) = self.closed.front() {
            let obsolete = match (oldest_unflushed, segment.max_seq()) {
                (Some(oldest), Some(max)) => max < oldest,
                _ => true,
            };
            if !obsolete {
                debug!(
                    path = ?segment.path,
                    max_sequence = ?segment.max_seq(),
                    oldest_unflushed = ?oldest_unflushed,
                    "Segment still holds unflushed edits"
                );
                break;
            }

            if let Err(e) = check_archivable(segment, tracker) {
                error!(error = %e, "Archival refused");
                break;
            }

            let target = self.archive(&segment.path).await?;
            self.closed.pop_front();
            archived.push(target);
        }

        if !archived.is_empty() {
            info!(
                archived = archived.len(),
                remaining = self.closed.len(),
                "Archived obsolete segments"
            );
        }
        Ok(archived)
    }

    /// Archive every closed segment that passes the per-region check.
    pub(crate) async fn archive_all(&mut self, tracker: &SequenceTracker) -> Result<Vec<PathBuf>> {
        let mut archived = Vec::new();
        let mut kept = VecDeque::new();

        while let Some(segment) = self.closed.pop_front() {
            if let Err(e) = check_archivable(&segment, tracker) {
                error!(error = %e, "Archival refused, segment left for splitting");
                kept.push_back(segment);
                continue;
            }
            match self.archive(&segment.path).await {
                Ok(target) => archived.push(target),
                Err(e) => {
                    kept.push_back(segment);
                    kept.extend(self.closed.drain(..));
                    self.closed = kept;
                    return Err(e);
                }
            }
        }

        self.closed = kept;
        Ok(archived)
    }

    async fn archive(&self, path: &Path) -> Result<PathBuf> {
        let file_name = path.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("segment path {:?} has no file name", path),
            )
        })?;
        tokio::fs::create_dir_all(&self.archive_dir).await?;
        let mut target = self.archive_dir.join(file_name);
        if tokio::fs::metadata(&target).await.is_ok() {
            target = self.free_archive_target(path).await;
            warn!(
                from = ?path,
                to = ?target,
                "Archive already holds a segment with this name, archiving under a new one"
            );
        }
        tokio::fs::rename(path, &target).await?;
        debug!(from = ?path, to = ?target, "Segment archived");
        Ok(target)
    }

    /// First unused `{prefix}-{n}.{index}` name in the archive, so the
    /// archived copy still parses as a segment name.
    async fn free_archive_target(&self, path: &Path) -> PathBuf {
        let (prefix, index) = match SegmentName::from_path(path) {
            Some(name) => (name.prefix, name.index),
            None => (
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                0,
            ),
        };
        let mut n: u64 = 1;
        loop {
            let candidate = self
                .archive_dir
                .join(compute_filename(&format!("{}-{}", prefix, n), index));
            if tokio::fs::metadata(&candidate).await.is_err() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Regions whose unflushed edits pin the oldest live segment, once more
    /// than `max_active` segments are live.
    pub(crate) fn regions_to_flush(&self, tracker: &SequenceTracker, max_active: usize) -> Vec<Bytes> {
        if self.closed.len() <= max_active {
            return Vec::new();
        }
        let Some(threshold) = self.closed.front().and_then(LogSegment::max_seq) else {
            return Vec::new();
        };

        let regions = regions_with_unflushed_edits_older_than(
            threshold,
            &tracker.unflushed_snapshot(),
            &tracker.flushing_snapshot(),
        );
        if !regions.is_empty() {
            info!(
                live_segments = self.closed.len(),
                max_active = max_active,
                regions = regions.len(),
                "Too many live segments, requesting flushes"
            );
        }
        regions
    }
}

/// Every region with edits in `segment` must be flushed past them.
fn check_archivable(segment: &LogSegment, tracker: &SequenceTracker) -> Result<()> {
    for (region, region_max) in segment.regions() {
        // Regions closed on this server persisted their flush point already
        let Some(state) = tracker.get(region) else {
            continue;
        };
        if state.last_flushed_seq.map_or(true, |flushed| flushed < region_max) {
            return Err(Error::ArchivalInvariantViolation {
                path: segment.path.clone(),
                region: String::from_utf8_lossy(region).into_owned(),
                region_max,
                flushed: state.last_flushed_seq,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Background roller
// ============================================================================

/// Rolls the log when the open segment grows too large or too old.
pub struct LogRoller {
    wal: Arc<Wal>,
    check_interval: Duration,
}

impl LogRoller {
    pub fn new(wal: Arc<Wal>) -> Self {
        let check_interval = wal.config().roll_check_interval();
        Self {
            wal,
            check_interval,
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` changes or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.check_interval.as_millis() as u64,
            "Log roller started"
        );

        let mut rolls: u64 = 0;
        let mut failures: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown.changed() => {
                    info!("Log roller received shutdown signal");
                    break;
                }
            }

            if !self.wal.needs_roll() {
                continue;
            }

            match self.wal.roll().await {
                Ok(archived) => {
                    rolls += 1;
                    debug!(count = rolls, archived = archived.len(), "Periodic roll complete");

                    let regions = self.wal.regions_to_flush().await;
                    if !regions.is_empty() {
                        warn!(
                            regions = regions.len(),
                            "Regions must flush before older segments can be archived"
                        );
                    }
                }
                Err(Error::Closed) => {
                    info!("WAL closed, log roller stopping");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failure_count = failures, "Periodic roll failed");
                }
            }
        }

        info!(total_rolls = rolls, total_failures = failures, "Log roller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncPolicy, WalConfig};
    use crate::segment::list_segments;
    use regionlog_core::{Cell, EditBatch};
    use tempfile::TempDir;

    fn edits() -> EditBatch {
        EditBatch::with_cells(vec![Cell::put("row", "cf", "q", 1, vec![b'v'; 64])])
    }

    async fn small_segment_wal(dir: &TempDir) -> Arc<Wal> {
        let config = WalConfig {
            roll_size_bytes: 256,
            sync_policy: SyncPolicy::Always,
            ..WalConfig::with_base_dir(dir.path())
        };
        Arc::new(Wal::open(config).await.unwrap())
    }

    async fn closed_segment(dir: &Path, index: u64, edits: &[(&str, u64)]) -> LogSegment {
        let path = dir.join(crate::segment::compute_filename("wal", index));
        tokio::fs::write(&path, b"").await.unwrap();
        let mut segment = LogSegment::new(path, index);
        for (region, seq) in edits {
            segment.record(&Bytes::copy_from_slice(region.as_bytes()), *seq);
        }
        segment
    }

    #[tokio::test]
    async fn test_archives_prefix_only() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let tracker = SequenceTracker::new();
        let mut roller = Roller::new(archive.clone());

        for (region, seq) in [("a", 1), ("a", 2), ("b", 3), ("a", 4)] {
            tracker.record_append(&Bytes::from(region), seq);
        }
        roller.push(closed_segment(dir.path(), 1, &[("a", 1), ("a", 2)]).await);
        roller.push(closed_segment(dir.path(), 2, &[("b", 3)]).await);
        roller.push(closed_segment(dir.path(), 3, &[("a", 4)]).await);

        tracker.complete_flush(b"a", 4);
        // b still holds seq 3: only the first segment is obsolete
        let archived = roller.archive_obsolete(&tracker).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with(&archive));
        assert!(tokio::fs::metadata(&archived[0]).await.is_ok());
        assert_eq!(roller.len(), 2);

        tracker.complete_flush(b"b", 3);
        let archived = roller.archive_obsolete(&tracker).await.unwrap();
        assert_eq!(archived.len(), 2);
        assert_eq!(roller.len(), 0);
    }

    #[tokio::test]
    async fn test_inconsistent_flush_point_refuses_archive() {
        let dir = TempDir::new().unwrap();
        let tracker = SequenceTracker::new();
        let mut roller = Roller::new(dir.path().join("archive"));

        // Tracker believes region "a" is fully flushed at 3, yet the segment
        // holds an edit of "a" at 5.
        tracker.record_append(&Bytes::from("a"), 3);
        tracker.complete_flush(b"a", 3);
        let segment = closed_segment(dir.path(), 1, &[("a", 5)]).await;
        let path = segment.path.clone();
        roller.push(segment);

        let archived = roller.archive_obsolete(&tracker).await.unwrap();
        assert!(archived.is_empty());
        assert_eq!(roller.len(), 1);
        assert!(tokio::fs::metadata(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_archive_all_keeps_unflushed() {
        let dir = TempDir::new().unwrap();
        let tracker = SequenceTracker::new();
        let mut roller = Roller::new(dir.path().join("archive"));

        tracker.record_append(&Bytes::from("a"), 1);
        tracker.record_append(&Bytes::from("b"), 2);
        tracker.complete_flush(b"a", 1);
        roller.push(closed_segment(dir.path(), 1, &[("a", 1)]).await);
        roller.push(closed_segment(dir.path(), 2, &[("b", 2)]).await);

        let archived = roller.archive_all(&tracker).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(roller.len(), 1);
    }

    #[tokio::test]
    async fn test_regions_to_flush_above_limit() {
        let dir = TempDir::new().unwrap();
        let tracker = SequenceTracker::new();
        let mut roller = Roller::new(dir.path().join("archive"));

        for seq in 1..=3u64 {
            let region = format!("r{}", seq);
            tracker.record_append(&Bytes::from(region.clone()), seq);
            roller.push(closed_segment(dir.path(), seq, &[(region.as_str(), seq)]).await);
        }

        assert!(roller.regions_to_flush(&tracker, 3).is_empty());
        let regions = roller.regions_to_flush(&tracker, 2);
        assert_eq!(regions, vec![Bytes::from("r1")]);
    }

    #[tokio::test]
    async fn test_archive_keeps_existing_file_with_same_name() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let name = crate::segment::compute_filename("wal", 1);
        tokio::fs::create_dir_all(&archive).await.unwrap();
        tokio::fs::write(archive.join(&name), b"older").await.unwrap();

        let tracker = SequenceTracker::new();
        let mut roller = Roller::new(archive.clone());
        roller.push(closed_segment(dir.path(), 1, &[]).await);

        let archived = roller.archive_obsolete(&tracker).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_ne!(archived[0], archive.join(&name));
        assert_eq!(tokio::fs::read(archive.join(&name)).await.unwrap(), b"older");
        assert!(tokio::fs::read(&archived[0]).await.unwrap().is_empty());

        // Both copies still look like segments to the cleaner
        let renamed = SegmentName::from_path(&archived[0]).unwrap();
        assert_eq!(renamed.index, 1);
        assert_eq!(list_segments(&archive, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_roller_rolls_oversized_segment() {
        let dir = TempDir::new().unwrap();
        let wal = small_segment_wal(&dir).await;
        let first = wal.current_segment_path();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = LogRoller::new(wal.clone())
            .with_check_interval(Duration::from_millis(10))
            .spawn(shutdown_rx);

        for i in 0..8u64 {
            wal.append("r1", "t", &edits(), i).await.unwrap();
        }
        wal.sync(true).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while wal.num_active_segments().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("roller never rolled");
        assert_ne!(wal.current_segment_path(), first);
        // r1 is unflushed, so the rolled segment stays live
        assert!(wal.active_segments().await.contains(&first));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("roller ignored shutdown")
            .unwrap();
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_roller_stops_when_wal_closed() {
        let dir = TempDir::new().unwrap();
        let wal = small_segment_wal(&dir).await;

        for i in 0..8u64 {
            wal.append("r1", "t", &edits(), i).await.unwrap();
        }
        wal.sync(true).await.unwrap();
        assert!(wal.needs_roll());
        wal.close().await.unwrap();

        // Shutdown never fires: the roller must stop on Error::Closed
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = LogRoller::new(wal.clone())
            .with_check_interval(Duration::from_millis(10))
            .spawn(shutdown_rx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("roller kept running after close")
            .unwrap();
    }
}
