//! Log Key
//!
//! Every record in a segment is addressed by a `LogKey`: which region and
//! table the edits belong to, the sequence id the log assigned, and the
//! wall-clock time of the write.
//!
//! ## Sequence ids
//! Sequence ids come from one counter per log instance, not per region, so
//! two regions sharing a server interleave in one id space. They are the
//! only ordering authority used by replay and retention; `write_time` is
//! informational.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of one log record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogKey {
    /// Encoded name of the region the edits belong to
    pub region_id: Bytes,

    /// Table the region is part of
    pub table_id: Bytes,

    /// Log-wide sequence id, assigned once at append time
    pub sequence_id: u64,

    /// Milliseconds since epoch when the edit was appended
    pub write_time: u64,
}

impl LogKey {
    pub fn new(
        region_id: impl Into<Bytes>,
        table_id: impl Into<Bytes>,
        sequence_id: u64,
        write_time: u64,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            table_id: table_id.into(),
            sequence_id,
            write_time,
        }
    }

    /// Region id rendered for logs and file names.
    pub fn region_display(&self) -> String {
        String::from_utf8_lossy(&self.region_id).into_owned()
    }
}
