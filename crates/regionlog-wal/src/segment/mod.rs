//! Log Segments
//!
//! A segment is one append-only file in the log directory. The writer keeps
//! exactly one segment open; rolling closes it and opens the next. Closed
//! segments stay in the log directory until every region with edits in them
//! has flushed, then they are moved to the archive directory, and finally the
//! retention cleaner deletes them.
//!
//! ## File names
//!
//! ```text
//! {prefix}.{index:020}        e.g. wal.00000001718000000000
//! ```
//!
//! The index is zero-padded so that lexicographic order equals index order.
//! Indices are strictly increasing for the lifetime of a log directory.
//!
//! ## Layout
//!
//! ```text
//! [Placeholder frame]["RLOG" + version]
//! [Entry frame 1][Entry frame 2]...[Entry frame N]
//! ```
//!
//! See `regionlog_core::entry` for the frame format.

pub mod file;
pub mod reader;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::warn;

use crate::error::Result;

pub use file::SegmentFile;
pub use reader::{LogReader, ReadOutcome, TailState};

/// Width of the zero-padded index in a segment file name.
pub const INDEX_WIDTH: usize = 20;

/// File name for segment `index`.
pub fn compute_filename(prefix: &str, index: u64) -> String {
    format!("{}.{:0width$}", prefix, index, width = INDEX_WIDTH)
}

/// A parsed segment file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub prefix: String,
    pub index: u64,
}

impl SegmentName {
    /// Parse a file name produced by [`compute_filename`].
    ///
    /// Returns `None` for anything else; the cleaner treats such files as
    /// malformed.
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, index) = name.rsplit_once('.')?;
        if prefix.is_empty() || index.len() != INDEX_WIDTH {
            return None;
        }
        if !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            index: index.parse().ok()?,
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
    }

    pub fn file_name(&self) -> String {
        compute_filename(&self.prefix, self.index)
    }
}

/// Metadata of one segment: where it is and which edits it holds.
#[derive(Debug, Clone)]
pub struct LogSegment {
    pub path: PathBuf,
    pub index: u64,
    min_seq: Option<u64>,
    max_seq: Option<u64>,
    entries: u64,
    /// region -> highest sequence id of that region in this segment
    regions: HashMap<Bytes, u64>,
}

impl LogSegment {
    pub fn new(path: PathBuf, index: u64) -> Self {
        Self {
            path,
            index,
            min_seq: None,
            max_seq: None,
            entries: 0,
            regions: HashMap::new(),
        }
    }

    /// Note an entry written to this segment.
    pub fn record(&mut self, region_id: &Bytes, sequence_id: u64) {
        self.min_seq = Some(self.min_seq.map_or(sequence_id, |m| m.min(sequence_id)));
        self.max_seq = Some(self.max_seq.map_or(sequence_id, |m| m.max(sequence_id)));
        self.entries += 1;

        match self.regions.get_mut(region_id) {
            Some(max) => *max = (*max).max(sequence_id),
            None => {
                self.regions.insert(region_id.clone(), sequence_id);
            }
        }
    }

    /// `(min, max)` sequence ids, `None` when the segment holds no entries.
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        self.min_seq.zip(self.max_seq)
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.max_seq
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn region_max(&self, region_id: &[u8]) -> Option<u64> {
        self.regions.get(region_id).copied()
    }

    pub fn regions(&self) -> impl Iterator<Item = (&Bytes, u64)> {
        self.regions.iter().map(|(region, max)| (region, *max))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Segment files in `dir`, ascending by index.
///
/// Files whose names do not parse are skipped with a warning. When `prefix` is given only
/// that prefix matches. A missing directory yields an empty list.
pub async fn list_segments(dir: &Path, prefix: Option<&str>) -> Result<Vec<(SegmentName, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = SegmentName::from_path(&path) else {
            warn!(path = ?path, "Ignoring non-segment file");
            continue;
        };
        if prefix.is_some_and(|p| p != name.prefix) {
            continue;
        }
        segments.push((name, path));
    }

    segments.sort_by_key(|(name, _)| name.index);
    Ok(segments)
}
