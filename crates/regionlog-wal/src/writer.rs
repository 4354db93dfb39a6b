//! Writer Task
//!
//! A dedicated tokio task owns the open segment. Every operation on the log
//! is a [`WalCmd`] sent over one mpsc channel, so the task is the single
//! point where sequence ids are handed out and bytes are ordered:
//!
//! ```text
//! append ─┐
//! sync   ─┼─→ [mpsc channel] ─→ Writer Task ─→ buffer ─→ write_all ─→ fdatasync
//! roll   ─┤                        │
//! close  ─┘                        └─ assigns sequence ids in channel order
//! ```
//!
//! Each pass of the loop takes one command, drains whatever else is already
//! queued, then performs at most one write + fsync for all sync callers in
//! that pass (group commit).
//!
//! Rolls and closes are executed inline at their position in the channel:
//! appends queued before a roll land in the old segment, appends after it in
//! the new one.
//!
//! ## Failure
//!
//! An I/O error while writing or syncing poisons the writer. Buffered edits
//! are dropped, pending syncs fail and appends are rejected with
//! `WriterFailed` until a roll opens a fresh segment.

use std::path::PathBuf;
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use regionlog_core::entry::encode_edit_frame;

use crate::config::{SyncPolicy, WalConfig};
use crate::error::{Error, Result};
use crate::segment::{compute_filename, LogSegment, SegmentFile};
use crate::tracker::SequenceTracker;

pub(crate) type SyncReply = oneshot::Sender<std::result::Result<(), String>>;

/// Commands sent to the writer task
pub(crate) enum WalCmd {
    /// Assign a sequence id and buffer the record
    Append {
        region_id: Bytes,
        table_id: Bytes,
        edits: Bytes,
        write_time: u64,
        reply: oneshot::Sender<Result<u64>>,
    },

    /// Make everything appended so far durable
    Sync { force: bool, reply: SyncReply },

    /// Open the next segment and close the current one
    Roll(oneshot::Sender<Result<LogSegment>>),

    /// Raise the next sequence id to at least `min_next`
    AdvanceSequence {
        min_next: u64,
        reply: oneshot::Sender<u64>,
    },

    /// Buffered records and bytes
    QueryPending(oneshot::Sender<PendingStats>),

    /// Flush, fsync and stop
    Close(oneshot::Sender<Result<LogSegment>>),
}

/// Records and bytes buffered but not yet handed to the OS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub records: usize,
    pub bytes: usize,
}

/// Writer state readable without a round trip through the channel.
#[derive(Debug, Default)]
pub(crate) struct WriterShared {
    pub current_index: AtomicU64,
    pub current_size: AtomicU64,
    pub segment_opened_ms: AtomicU64,
    pub last_sequence: AtomicU64,
    /// Makes every flush fail while set
    #[cfg(test)]
    pub fail_writes: AtomicBool,
}

impl WriterShared {
    #[cfg(test)]
    fn check_write(&self) -> std::io::Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_write(&self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) struct WalWriter {
    log_dir: PathBuf,
    prefix: String,
    segment: Option<SegmentFile>,
    current: LogSegment,
    buffer: BytesMut,
    buffer_count: usize,
    buffer_started: Option<Instant>,
    /// Written to the OS since the last fsync
    dirty: bool,
    last_sync: Instant,
    next_seq: u64,
    failed: Option<String>,
    closed: bool,
    tracker: Arc<SequenceTracker>,
    shared: Arc<WriterShared>,
    sync_policy: SyncPolicy,
    batch_max_records: usize,
    batch_max_bytes: usize,
    batch_max_age: Duration,
}

impl WalWriter {
    /// Open the first segment of a fresh log directory.
    pub(crate) async fn start(
        config: &WalConfig,
        tracker: Arc<SequenceTracker>,
        shared: Arc<WriterShared>,
    ) -> Result<Self> {
        let index = now_ms();
        let path = config.log_dir.join(compute_filename(&config.file_prefix, index));
        let segment = SegmentFile::create(&path, now_ms()).await?;

        shared.current_index.store(index, Ordering::Relaxed);
        shared.current_size.store(segment.size(), Ordering::Relaxed);
        shared.segment_opened_ms.store(now_ms(), Ordering::Relaxed);

        Ok(Self {
            log_dir: config.log_dir.clone(),
            prefix: config.file_prefix.clone(),
            segment: Some(segment),
            current: LogSegment::new(path, index),
            buffer: BytesMut::with_capacity(config.batch_max_bytes),
            buffer_count: 0,
            buffer_started: None,
            dirty: false,
            last_sync: Instant::now(),
            next_seq: 1,
            failed: None,
            closed: false,
            tracker,
            shared,
            sync_policy: config.sync_policy,
            batch_max_records: config.batch_max_records,
            batch_max_bytes: config.batch_max_bytes,
            batch_max_age: config.batch_max_age(),
        })
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<WalCmd>) {
        loop {
            // Step 1: wait for a command, or for the next timed flush
            let first = match self.next_deadline() {
                None => match rx.recv().await {
                    Some(cmd) => cmd,
                    None => break,
                },
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(_) => {
                        self.on_timer().await;
                        continue;
                    }
                },
            };

            // Step 2: process it and drain everything already queued
            let mut sync_waiters: Vec<(bool, SyncReply)> = Vec::new();
            let mut queries: Vec<oneshot::Sender<PendingStats>> = Vec::new();

            self.process_cmd(first, &mut sync_waiters, &mut queries).await;
            while !self.closed {
                match rx.try_recv() {
                    Ok(cmd) => self.process_cmd(cmd, &mut sync_waiters, &mut queries).await,
                    Err(_) => break,
                }
            }

            // Step 3: one physical flush for every sync caller
            if !sync_waiters.is_empty() {
                let force = sync_waiters.iter().any(|(force, _)| *force);
                let result = self.group_commit(force).await;
                for (_, waiter) in sync_waiters {
                    let _ = waiter.send(result.clone());
                }
            } else if self.over_threshold() {
                self.flush_or_fail(self.sync_policy == SyncPolicy::Always).await;
            }

            for query in queries {
                let _ = query.send(self.pending());
            }

            if self.closed {
                break;
            }
        }

        if !self.closed && self.failed.is_none() {
            if let Err(e) = self.flush_buffer(true).await {
                warn!(path = ?self.current.path, error = %e, "Final WAL flush failed");
            }
        }
        debug!(path = ?self.current.path, "WAL writer task stopped");
    }

    async fn process_cmd(
        &mut self,
        cmd: WalCmd,
        sync_waiters: &mut Vec<(bool, SyncReply)>,
        queries: &mut Vec<oneshot::Sender<PendingStats>>,
    ) {
        match cmd {
            WalCmd::Append {
                region_id,
                table_id,
                edits,
                write_time,
                reply,
            } => {
                let _ = reply.send(self.append(region_id, table_id, &edits, write_time));
            }
            WalCmd::Sync { force, reply } => sync_waiters.push((force, reply)),
            WalCmd::Roll(reply) => {
                let _ = reply.send(self.roll().await);
            }
            WalCmd::AdvanceSequence { min_next, reply } => {
                self.next_seq = self.next_seq.max(min_next);
                let _ = reply.send(self.next_seq);
            }
            WalCmd::QueryPending(reply) => queries.push(reply),
            WalCmd::Close(reply) => {
                let _ = reply.send(self.close().await);
            }
        }
    }

    fn append(
        &mut self,
        region_id: Bytes,
        table_id: Bytes,
        edits: &[u8],
        write_time: u64,
    ) -> Result<u64> {
        if self.closed {
            return Err(Error::Closed);
        }
        if let Some(reason) = &self.failed {
            return Err(Error::WriterFailed(reason.clone()));
        }

        // An oversized record is refused before it takes a sequence id
        let sequence_id = self.next_seq;
        encode_edit_frame(
            &mut self.buffer,
            sequence_id,
            write_time,
            &region_id,
            &table_id,
            edits,
        )?;
        self.next_seq += 1;
        self.buffer_count += 1;
        if self.buffer_started.is_none() {
            self.buffer_started = Some(Instant::now());
        }

        self.current.record(&region_id, sequence_id);
        self.tracker.record_append(&region_id, sequence_id);
        self.shared.last_sequence.store(sequence_id, Ordering::Release);

        Ok(sequence_id)
    }

    async fn group_commit(&mut self, force: bool) -> std::result::Result<(), String> {
        if let Some(reason) = &self.failed {
            return Err(reason.clone());
        }
        if self.segment.is_none() {
            // Closed: the close already made everything durable
            return Ok(());
        }

        let fsync = force || self.sync_policy != SyncPolicy::Never;
        self.flush_buffer(fsync).await.map_err(|e| {
            let reason = e.to_string();
            self.fail(reason.clone());
            reason
        })
    }

    async fn flush_or_fail(&mut self, fsync: bool) {
        if let Err(e) = self.flush_buffer(fsync).await {
            self.fail(e.to_string());
        }
    }

    /// Hand the buffer to the OS, then fdatasync if asked and needed.
    async fn flush_buffer(&mut self, fsync: bool) -> std::io::Result<()> {
        let Some(segment) = self.segment.as_mut() else {
            return Ok(());
        };

        let records = std::mem::take(&mut self.buffer_count);
        let bytes = self.buffer.len();
        self.shared.check_write()?;

        if bytes > 0 {
            let data = self.buffer.split();
            self.buffer_started = None;
            segment.append(&data).await?;
            self.dirty = true;
            self.shared.current_size.store(segment.size(), Ordering::Relaxed);
        }

        if fsync && self.dirty {
            segment.sync().await?;
            self.dirty = false;
            self.last_sync = Instant::now();
        }

        if bytes > 0 {
            debug!(
                path = ?self.current.path,
                records = records,
                bytes = bytes,
                synced = fsync,
                "WAL group commit"
            );
        }
        Ok(())
    }

    fn fail(&mut self, reason: String) {
        error!(
            path = ?self.current.path,
            error = %reason,
            dropped_records = self.buffer_count,
            "WAL write failed, rejecting appends until next roll"
        );
        self.failed = Some(reason);
        self.buffer.clear();
        self.buffer_count = 0;
        self.buffer_started = None;
    }

    fn over_threshold(&self) -> bool {
        self.buffer_count >= self.batch_max_records
            || (self.batch_max_bytes > 0 && self.buffer.len() >= self.batch_max_bytes)
    }

    fn pending(&self) -> PendingStats {
        PendingStats {
            records: self.buffer_count,
            bytes: self.buffer.len(),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.segment.is_none() || self.failed.is_some() {
            return None;
        }
        let age = self.buffer_started.map(|t| t + self.batch_max_age);
        let interval = match self.sync_policy {
            SyncPolicy::Interval { interval } if self.dirty || !self.buffer.is_empty() => {
                Some(self.last_sync + interval)
            }
            _ => None,
        };
        match (age, interval) {
            (Some(a), Some(i)) => Some(a.min(i)),
            (a, i) => a.or(i),
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let age_due = self
            .buffer_started
            .is_some_and(|t| now >= t + self.batch_max_age);
        let interval_due = match self.sync_policy {
            SyncPolicy::Interval { interval } => {
                (self.dirty || !self.buffer.is_empty()) && now >= self.last_sync + interval
            }
            _ => false,
        };

        if age_due || interval_due {
            let fsync = interval_due || self.sync_policy == SyncPolicy::Always;
            self.flush_or_fail(fsync).await;
        }
    }

    fn next_index(&self) -> u64 {
        now_ms().max(self.current.index + 1)
    }

    async fn roll(&mut self) -> Result<LogSegment> {
        if self.closed {
            return Err(Error::Closed);
        }

        // Open the next segment before touching the current one
        let index = self.next_index();
        let path = self.log_dir.join(compute_filename(&self.prefix, index));
        let next = SegmentFile::create(&path, now_ms()).await?;

        if self.failed.is_none() {
            if let Err(e) = self.flush_buffer(true).await {
                self.fail(e.to_string());
                drop(next);
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    warn!(path = ?path, error = %remove_err, "Failed to remove unused segment");
                }
                return Err(e.into());
            }
        } else {
            warn!(
                path = ?self.current.path,
                "Rolling failed WAL writer, abandoning unsynced edits"
            );
        }

        let next_size = next.size();
        if let Some(previous) = self.segment.replace(next) {
            if let Err(e) = previous.close().await {
                warn!(path = ?self.current.path, error = %e, "Failed to close rolled segment");
            }
        }
        let closed = std::mem::replace(&mut self.current, LogSegment::new(path, index));

        self.failed = None;
        self.dirty = false;
        self.last_sync = Instant::now();
        self.shared.current_index.store(index, Ordering::Relaxed);
        self.shared.current_size.store(next_size, Ordering::Relaxed);
        self.shared.segment_opened_ms.store(now_ms(), Ordering::Relaxed);

        info!(
            closed = ?closed.path,
            entries = closed.entries(),
            max_sequence = ?closed.max_seq(),
            opened = ?self.current.path,
            "WAL rolled"
        );

        Ok(closed)
    }

    async fn close(&mut self) -> Result<LogSegment> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.closed = true;

        if let Some(reason) = self.failed.clone() {
            self.segment = None;
            return Err(Error::WriterFailed(reason));
        }

        if let Err(e) = self.flush_buffer(true).await {
            self.fail(e.to_string());
            self.segment = None;
            return Err(e.into());
        }
        if let Some(segment) = self.segment.take() {
            segment.close().await?;
        }

        info!(
            path = ?self.current.path,
            entries = self.current.entries(),
            last_sequence = self.next_seq - 1,
            "WAL closed"
        );

        Ok(self.current.clone())
    }
}
