//! Write-Ahead Log
//!
//! [`Wal`] is the handle regions use to make mutations durable before they
//! are applied to the memstore. It wraps the writer task, the sequence
//! tracker and the roller.
//!
//! ## Lifecycle
//!
//! ```text
//! Wal::open ─→ append/sync ... ─→ roll ─→ append/sync ... ─→ close
//!                                  │
//!                                  └─→ closed segment ─→ archive_dir (once flushed)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use regionlog_wal::{Wal, WalConfig};
//!
//! let wal = Wal::open(WalConfig::with_base_dir("/data/wal/server-1")).await?;
//!
//! let seq = wal.append("region-a", "orders", &edits, now_ms).await?;
//! wal.sync(false).await?;                 // durable from here on
//!
//! let flush_seq = wal.start_flush(b"region-a");
//! // ... persist memstore ...
//! wal.complete_flush(b"region-a", flush_seq);
//!
//! let archived = wal.roll().await?;       // obsolete segments moved away
//! wal.close().await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use regionlog_core::EditBatch;

use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::roller::Roller;
use crate::segment::{compute_filename, list_segments};
use crate::tracker::{RegionSequence, SequenceTracker};
use crate::writer::{now_ms, PendingStats, WalCmd, WalWriter, WriterShared};

#[derive(Debug)]
pub struct Wal {
    config: WalConfig,

    /// Channel sender to writer task
    cmd_tx: mpsc::Sender<WalCmd>,

    /// Writer state readable without a channel round trip
    shared: Arc<WriterShared>,

    tracker: Arc<SequenceTracker>,

    /// Closed, unarchived segments; the lock also serialises rolls
    roller: tokio::sync::Mutex<Roller>,

    /// Writer task handle (aborted on drop unless closed)
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Wal {
    fn drop(&mut self) {
        let handle = match self.writer_handle.get_mut() {
            Ok(handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Wal {
    /// Open a log in `config.log_dir`, which must hold no segments.
    ///
    /// Segments left by a previous instance belong to crash recovery: split
    /// them before reusing the directory.
    pub async fn open(config: WalConfig) -> Result<Self> {
        Self::open_with_tracker(config, Arc::new(SequenceTracker::new())).await
    }

    pub async fn open_with_tracker(config: WalConfig, tracker: Arc<SequenceTracker>) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.log_dir).await?;
        tokio::fs::create_dir_all(config.archive_target_dir()).await?;

        if !list_segments(&config.log_dir, None).await?.is_empty() {
            return Err(Error::ActiveDirNotEmpty(config.log_dir.clone()));
        }

        let shared = Arc::new(WriterShared::default());
        let writer = WalWriter::start(&config, tracker.clone(), shared.clone()).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let writer_handle = tokio::spawn(writer.run(cmd_rx));

        info!(
            log_dir = ?config.log_dir,
            archive_dir = ?config.archive_target_dir(),
            sync_policy = ?config.sync_policy,
            "WAL opened"
        );

        Ok(Self {
            roller: tokio::sync::Mutex::new(Roller::new(config.archive_target_dir())),
            config,
            cmd_tx,
            shared,
            tracker,
            writer_handle: Mutex::new(Some(writer_handle)),
        })
    }

    async fn send(&self, cmd: WalCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Closed)
    }

    /// Assign a sequence id to `edits` and buffer them.
    ///
    /// The edits are not durable until a later [`sync`](Self::sync) returns.
    /// A record whose body would exceed `MAX_RECORD_SIZE` fails with
    /// `RecordTooLarge` and takes no sequence id.
    pub async fn append(
        &self,
        region_id: impl Into<Bytes>,
        table_id: impl Into<Bytes>,
        edits: &EditBatch,
        write_time: u64,
    ) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::Append {
            region_id: region_id.into(),
            table_id: table_id.into(),
            edits: edits.encode(),
            write_time,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Make every edit appended before this call durable.
    ///
    /// Concurrent calls share one physical flush. With `force` the flush
    /// fsyncs even under `SyncPolicy::Never`.
    pub async fn sync(&self, force: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::Sync { force, reply }).await?;
        rx.await
            .map_err(|_| Error::Closed)?
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(())
    }

    /// Close the open segment, start a new one, and archive every closed
    /// segment that no region needs any more. Returns the archived paths.
    pub async fn roll(&self) -> Result<Vec<PathBuf>> {
        let mut roller = self.roller.lock().await;

        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::Roll(reply)).await?;
        let closed = rx.await.map_err(|_| Error::Closed)??;
        roller.push(closed);

        roller.archive_obsolete(&self.tracker).await
    }

    /// Closed segments still in the log directory (the open one excluded).
    pub async fn num_active_segments(&self) -> usize {
        self.roller.lock().await.len()
    }

    /// Paths of closed segments still in the log directory, oldest first.
    pub async fn active_segments(&self) -> Vec<PathBuf> {
        self.roller.lock().await.closed_paths()
    }

    /// Regions that should flush so the oldest live segment can be archived.
    /// Empty while the live segment count is within `max_active_segments`.
    pub async fn regions_to_flush(&self) -> Vec<Bytes> {
        self.roller
            .lock()
            .await
            .regions_to_flush(&self.tracker, self.config.max_active_segments)
    }

    /// Whether the open segment has reached the roll size or roll period.
    pub fn needs_roll(&self) -> bool {
        let size = self.shared.current_size.load(Ordering::Relaxed);
        let opened = self.shared.segment_opened_ms.load(Ordering::Relaxed);
        let age = Duration::from_millis(now_ms().saturating_sub(opened));
        size >= self.config.roll_size_bytes || age >= self.config.roll_period()
    }

    // ------------------------------------------------------------------
    // Flush bookkeeping
    // ------------------------------------------------------------------

    pub fn start_flush(&self, region_id: &[u8]) -> u64 {
        self.tracker.start_flush(region_id)
    }

    pub fn complete_flush(&self, region_id: &[u8], sequence_id: u64) {
        self.tracker.complete_flush(region_id, sequence_id)
    }

    pub fn abort_flush(&self, region_id: &[u8]) {
        self.tracker.abort_flush(region_id)
    }

    /// Forget a region closed on this server.
    pub fn remove_region(&self, region_id: &[u8]) -> Option<RegionSequence> {
        self.tracker.remove_region(region_id)
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    /// Ensure the next sequence id is at least `min_next`, e.g. when a region
    /// opens with a stored sequence id above the log's counter. Returns the
    /// next sequence id.
    pub async fn advance_sequence(&self, min_next: u64) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::AdvanceSequence { min_next, reply }).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Highest sequence id assigned so far, 0 before the first append.
    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::Acquire)
    }

    /// Bytes handed to the OS for the open segment.
    pub fn current_segment_size(&self) -> u64 {
        self.shared.current_size.load(Ordering::Relaxed)
    }

    pub fn current_segment_path(&self) -> PathBuf {
        let index = self.shared.current_index.load(Ordering::Relaxed);
        self.config
            .log_dir
            .join(compute_filename(&self.config.file_prefix, index))
    }

    pub async fn pending(&self) -> Result<PendingStats> {
        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::QueryPending(reply)).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.config.archive_target_dir()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Flush and fsync everything, then stop the writer. Later calls fail
    /// with `Error::Closed`.
    pub async fn close(&self) -> Result<()> {
        let closed = self.close_writer().await?;
        self.roller.lock().await.push(closed);
        Ok(())
    }

    /// Close, then archive every segment whose regions are all flushed.
    /// Segments with unflushed edits stay in the log directory.
    pub async fn close_and_archive(&self) -> Result<Vec<PathBuf>> {
        let closed = self.close_writer().await?;
        let mut roller = self.roller.lock().await;
        roller.push(closed);
        roller.archive_all(&self.tracker).await
    }

    async fn close_writer(&self) -> Result<crate::segment::LogSegment> {
        let (reply, rx) = oneshot::channel();
        self.send(WalCmd::Close(reply)).await?;
        let closed = rx.await.map_err(|_| Error::Closed)??;

        let handle = match self.writer_handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::segment::LogReader;
    use regionlog_core::entry::MAX_RECORD_SIZE;
    use regionlog_core::Cell;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WalConfig {
        WalConfig {
            sync_policy: SyncPolicy::Always,
            ..WalConfig::with_base_dir(dir.path())
        }
    }

    fn edits(n: usize) -> EditBatch {
        (0..n)
            .map(|i| Cell::put(format!("row{}", i), "cf", "q", i as u64, "value"))
            .collect()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequences() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();

        let a = wal.append("r1", "t", &edits(1), 1).await.unwrap();
        let b = wal.append("r2", "t", &edits(1), 2).await.unwrap();
        let c = wal.append("r1", "t", &edits(1), 3).await.unwrap();
        assert!(a < b && b < c);
        assert_eq!(wal.last_sequence(), c);
        assert_eq!(wal.tracker().get(b"r1").unwrap().last_assigned_seq, c);

        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_makes_appends_readable() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();

        for i in 0..10u64 {
            wal.append("r1", "t", &edits(2), i).await.unwrap();
        }
        wal.sync(false).await.unwrap();

        let outcome = LogReader::open(wal.current_segment_path())
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(outcome.entries.len(), 10);
        assert!(outcome.entries.iter().all(|e| e.edits.len() == 2));

        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_never_policy_still_writes_on_sync() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            sync_policy: SyncPolicy::Never,
            ..WalConfig::with_base_dir(dir.path())
        })
        .await
        .unwrap();

        wal.append("r1", "t", &edits(1), 1).await.unwrap();
        wal.sync(false).await.unwrap();
        wal.sync(true).await.unwrap();

        let outcome = LogReader::open(wal.current_segment_path())
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(outcome.entries.len(), 1);
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_refuses_non_empty_log_dir() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        tokio::fs::create_dir_all(&config.log_dir).await.unwrap();
        tokio::fs::write(config.log_dir.join(compute_filename("wal", 5)), b"")
            .await
            .unwrap();

        assert!(matches!(
            Wal::open(config).await,
            Err(Error::ActiveDirNotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn test_advance_sequence() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();

        wal.append("r1", "t", &edits(1), 1).await.unwrap();
        assert_eq!(wal.advance_sequence(100).await.unwrap(), 100);
        assert_eq!(wal.append("r1", "t", &edits(1), 1).await.unwrap(), 100);
        // Never moves backwards
        assert_eq!(wal.advance_sequence(5).await.unwrap(), 101);

        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_wal_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();
        wal.append("r1", "t", &edits(1), 1).await.unwrap();
        wal.close().await.unwrap();

        assert!(matches!(
            wal.append("r1", "t", &edits(1), 2).await,
            Err(Error::Closed)
        ));
        assert!(matches!(wal.sync(true).await, Err(Error::Closed)));
        assert!(matches!(wal.roll().await, Err(Error::Closed)));
        assert!(matches!(wal.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_pending_and_batch_threshold() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            batch_max_records: 5,
            batch_max_age_ms: 60_000,
            sync_policy: SyncPolicy::Never,
            ..WalConfig::with_base_dir(dir.path())
        })
        .await
        .unwrap();

        for i in 0..3u64 {
            wal.append("r1", "t", &edits(1), i).await.unwrap();
        }
        assert_eq!(wal.pending().await.unwrap().records, 3);

        for i in 3..5u64 {
            wal.append("r1", "t", &edits(1), i).await.unwrap();
        }
        // Threshold reached: the buffer was handed to the OS
        assert_eq!(wal.pending().await.unwrap().records, 0);

        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_needs_roll_on_size() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig {
            roll_size_bytes: 512,
            ..config(&dir)
        })
        .await
        .unwrap();
        assert!(!wal.needs_roll());

        for i in 0..20u64 {
            wal.append("r1", "t", &edits(2), i).await.unwrap();
        }
        wal.sync(false).await.unwrap();
        assert!(wal.needs_roll());

        wal.roll().await.unwrap();
        assert!(!wal.needs_roll());
        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_append_takes_no_sequence() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();

        let huge = EditBatch::with_cells(vec![Cell::put(
            "row",
            "cf",
            "q",
            1,
            vec![0u8; MAX_RECORD_SIZE],
        )]);
        assert!(matches!(
            wal.append("r1", "t", &huge, 1).await,
            Err(Error::Codec(regionlog_core::Error::RecordTooLarge(_)))
        ));
        assert_eq!(wal.last_sequence(), 0);
        assert!(wal.tracker().get(b"r1").is_none());

        assert_eq!(wal.append("r1", "t", &edits(1), 2).await.unwrap(), 1);
        wal.sync(true).await.unwrap();

        let outcome = LogReader::open(wal.current_segment_path())
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(outcome.tail, crate::segment::TailState::Clean);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].key.sequence_id, 1);

        wal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_poisons_until_roll() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(config(&dir)).await.unwrap();

        assert_eq!(wal.append("r1", "t", &edits(1), 1).await.unwrap(), 1);
        wal.shared.fail_writes.store(true, Ordering::Relaxed);
        assert!(wal.sync(true).await.is_err());

        // Poisoned: appends and syncs fail without touching the file
        assert!(matches!(
            wal.append("r1", "t", &edits(1), 2).await,
            Err(Error::WriterFailed(_))
        ));
        wal.shared.fail_writes.store(false, Ordering::Relaxed);
        assert!(wal.sync(true).await.is_err());
        assert!(matches!(
            wal.append("r1", "t", &edits(1), 2).await,
            Err(Error::WriterFailed(_))
        ));

        // A roll opens a fresh segment and clears the failure
        let poisoned = wal.current_segment_path();
        wal.roll().await.unwrap();
        assert_ne!(wal.current_segment_path(), poisoned);
        assert_eq!(wal.append("r1", "t", &edits(1), 3).await.unwrap(), 2);
        wal.sync(true).await.unwrap();

        let outcome = LogReader::open(wal.current_segment_path())
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        let seqs: Vec<u64> = outcome.entries.iter().map(|e| e.key.sequence_id).collect();
        assert_eq!(seqs, vec![2]);

        wal.close().await.unwrap();
    }
}
