//! WAL Error Types
//!
//! This module defines all error types that can occur in write-ahead log
//! operations.
//!
//! ## Error Categories
//!
//! ### Writer Errors
//! - `Io`: underlying file operation failed. Fatal to the writer: it stops
//!   accepting appends until the next successful roll.
//! - `WriterFailed`: an earlier sync failed and the writer is poisoned
//! - `Closed`: the writer task has shut down
//!
//! ### Read Errors
//! - `TruncatedRecord`: the last frame of a file is incomplete or fails its
//!   checksum with nothing after it. Expected after a crash; recoverable.
//! - `CorruptRecord`: damage with more data after it, or a bad placeholder
//!
//! ### Recovery Errors
//! - `LeaseConflict`: another writer still holds the file (retryable)
//! - `LeaseRecoveryFailed`: retries exhausted
//!
//! ### Retention Errors
//! - `ArchivalInvariantViolation`: a segment was about to be archived while
//!   a region still had unflushed edits in it. The segment is kept.
//!
//! All WAL operations return `Result<T>`, aliased to `Result<T, Error>`.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] regionlog_core::Error),

    #[error("Truncated record in {path:?} at offset {offset}")]
    TruncatedRecord { path: PathBuf, offset: u64 },

    #[error("Corrupt record in {path:?} at offset {offset}: {reason}")]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Lease conflict on {path:?}: {reason}")]
    LeaseConflict { path: PathBuf, reason: String },

    #[error("Lease recovery on {path:?} failed after {attempts} attempts")]
    LeaseRecoveryFailed { path: PathBuf, attempts: u32 },

    #[error(
        "Refusing to archive {path:?}: region {region} has edits up to {region_max} but is flushed only to {flushed:?}"
    )]
    ArchivalInvariantViolation {
        path: PathBuf,
        region: String,
        region_max: u64,
        flushed: Option<u64>,
    },

    #[error("WAL writer failed: {0}")]
    WriterFailed(String),

    #[error("WAL writer task closed")]
    Closed,

    #[error("Active log directory {0:?} already contains segments")]
    ActiveDirNotEmpty(PathBuf),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LeaseConflict { .. })
    }

    /// Damage confined to the end of a file, as left by a crash mid-write.
    pub fn is_tail_damage(&self) -> bool {
        matches!(self, Error::TruncatedRecord { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let lease = Error::LeaseConflict {
            path: PathBuf::from("/wal/x"),
            reason: "held".to_string(),
        };
        assert!(lease.is_retryable());
        assert!(!lease.is_tail_damage());

        let tail = Error::TruncatedRecord {
            path: PathBuf::from("/wal/x"),
            offset: 10,
        };
        assert!(tail.is_tail_damage());
        assert!(!tail.is_retryable());

        let corrupt = Error::CorruptRecord {
            path: PathBuf::from("/wal/x"),
            offset: 10,
            reason: "crc".to_string(),
        };
        assert!(!corrupt.is_tail_damage());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk"));
    }
}
