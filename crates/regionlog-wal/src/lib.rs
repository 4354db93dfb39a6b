//! regionlog WAL
//!
//! The per-server write-ahead log of a region-partitioned key-value store.
//! Every region hosted by a server appends its edits to one shared log;
//! memstores are flushed independently and the log is trimmed behind them.
//!
//! ## Architecture Overview
//!
//! ```text
//!  regions ──append──► ┌──────────────┐   group commit   ┌────────────────┐
//!                      │  Wal handle  │ ───────────────► │  writer task   │
//!  regions ──sync────► │  (mpsc cmds) │                  │  open segment  │
//!                      └──────┬───────┘                  └───────┬────────┘
//!                             │ roll()                           │ closed
//!                             ▼                                  ▼
//!                      ┌──────────────┐  oldest unflushed ┌────────────────┐
//!                      │    Roller    │ ◄──────────────── │ SequenceTracker│
//!                      └──────┬───────┘                   └────────────────┘
//!                             │ archive
//!                             ▼
//!                      ┌──────────────┐                   ┌────────────────┐
//!                      │ archive dir  │ ◄──── deletes ─── │   LogCleaner   │
//!                      └──────────────┘                   └────────────────┘
//!
//!  crash recovery:  recover_leases ──► LogSplitter ──► <region>.log files
//! ```
//!
//! ## Main Components
//!
//! - [`Wal`]: the handle. Appends get a sequence id and land in the current
//!   segment; `sync` makes everything appended so far durable, batching
//!   concurrent callers into one fsync.
//! - [`SequenceTracker`]: per-region sequence bookkeeping that decides which
//!   closed segments hold nothing unflushed.
//! - [`LogRoller`]: the background chore that rolls on size or age.
//! - [`LogSplitter`]: partitions a dead server's log by region.
//! - [`LogReader`]: reads a segment and tells a clean end from a torn tail
//!   or corruption.
//! - [`LogCleaner`]: deletes archived segments under a pluggable policy.
//!
//! ## Example
//!
//! ```rust,no_run
//! use regionlog_core::{Cell, EditBatch};
//! use regionlog_wal::{Wal, WalConfig};
//!
//! # async fn example() -> regionlog_wal::Result<()> {
//! let wal = Wal::open(WalConfig::with_base_dir("/var/lib/regionlog")).await?;
//!
//! let edits: EditBatch = vec![Cell::put("row-1", "cf", "q", 1, "value")].into();
//! let seq = wal.append("region-a", "users", &edits, 1).await?;
//! wal.sync(false).await?;
//!
//! // After the region's memstore is written out
//! let flush_seq = wal.start_flush(b"region-a");
//! wal.complete_flush(b"region-a", flush_seq);
//! let archived = wal.roll().await?;
//! # let _ = (seq, archived);
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod config;
pub mod error;
pub mod lease;
pub mod retry;
pub mod roller;
pub mod segment;
pub mod splitter;
pub mod tracker;
pub mod wal;
mod writer;

pub use cleaner::{
    CleanerStats, DelegateRegistry, KeepAllCleaner, LogCleaner, LogCleanerDelegate,
    TimeToLiveCleaner,
};
pub use config::{RetentionConfig, SplitConfig, SyncPolicy, WalConfig};
pub use error::{Error, Result};
pub use lease::{recover_lease_with_retry, recover_leases, LeaseRecovery, LocalLeaseRecovery};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use roller::LogRoller;
pub use segment::{compute_filename, LogReader, LogSegment, ReadOutcome, SegmentName, TailState};
pub use splitter::{region_output_name, split, LogSplitter, SplitStats};
pub use tracker::{regions_with_unflushed_edits_older_than, RegionSequence, SequenceTracker};
pub use wal::Wal;
pub use writer::PendingStats;
