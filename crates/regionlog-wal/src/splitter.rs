//! Log Splitter
//!
//! After a server dies its segments hold edits for many regions,
//! interleaved. Before those regions can reopen elsewhere their edits must
//! be separated so each new owner replays only its own. The splitter reads
//! every segment of the dead server and writes one output file per region.
//!
//! ```text
//! source_dir/                          output_dir/
//!   wal.…001  [r1:1][r2:2][r1:3]  ─┐     <hex r1>.log  [1][3][5]
//!   wal.…002  [r2:4][r1:5]        ─┼─→   <hex r2>.log  [2][4][6]
//!   wal.…003  [r2:6]              ─┘
//! ```
//!
//! ## Processing
//!
//! 1. Segments are read in ascending index order, `batch_size` at a time,
//!    into per-region buffers.
//! 2. Each batch's buffers are appended to their region's output by up to
//!    `writers` concurrent tasks.
//! 3. When every segment is consumed all outputs are fsynced and closed.
//!
//! Outputs use the segment format (placeholder first), so `LogReader` reads
//! them back. Within an output sequence ids strictly increase; an edit that
//! would break that is skipped with a warning.
//!
//! A torn tail ends the read of that segment with a warning. Any other
//! damage fails the whole split, leaving the sources untouched.
//!
//! Lease recovery is the caller's job: see `lease::recover_leases`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use regionlog_core::LogEntry;

use crate::config::SplitConfig;
use crate::error::{Error, Result};
use crate::segment::{list_segments, LogReader, SegmentFile, TailState};
use crate::writer::now_ms;

/// Outcome of one split.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub segments_read: usize,
    pub records_read: u64,
    pub records_written: u64,
    /// Edits dropped for breaking per-region sequence order
    pub records_skipped: u64,
    /// Segments that ended in a torn record
    pub truncated_segments: usize,
    /// Per-region output files, sorted
    pub outputs: Vec<PathBuf>,
}

/// Output file name for a region.
pub fn region_output_name(region_id: &[u8]) -> String {
    format!("{}.log", hex::encode(region_id))
}

/// Split with the default configuration.
pub async fn split(source_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    LogSplitter::default().split(source_dir, output_dir).await
}

#[derive(Debug, Clone, Default)]
pub struct LogSplitter {
    config: SplitConfig,
}

impl LogSplitter {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// Partition every segment in `source_dir` into per-region files in
    /// `output_dir`. Returns the output paths, sorted.
    pub async fn split(&self, source_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.split_with_stats(source_dir, output_dir).await?.outputs)
    }

    pub async fn split_with_stats(&self, source_dir: &Path, output_dir: &Path) -> Result<SplitStats> {
        let segments = list_segments(source_dir, None).await?;
        let mut stats = SplitStats::default();
        if segments.is_empty() {
            info!(source = ?source_dir, "No segments to split");
            return Ok(stats);
        }

        info!(
            source = ?source_dir,
            output = ?output_dir,
            segments = segments.len(),
            "Splitting log"
        );
        tokio::fs::create_dir_all(output_dir).await?;

        let batch_size = self.config.batch_size.max(1);
        let mut outputs: HashMap<Bytes, RegionOutput> = HashMap::new();
        let mut last_seq: HashMap<Bytes, u64> = HashMap::new();

        for batch in segments.chunks(batch_size) {
            let mut buffers: HashMap<Bytes, Vec<LogEntry>> = HashMap::new();

            for (_, path) in batch {
                let outcome = LogReader::open(path).await?.read_to_end().await?;
                stats.segments_read += 1;
                if let TailState::Truncated { offset } = outcome.tail {
                    warn!(
                        path = ?path,
                        offset = offset,
                        recovered = outcome.entries.len(),
                        "Segment ends in a torn record, continuing with next segment"
                    );
                    stats.truncated_segments += 1;
                }

                for entry in outcome.entries {
                    stats.records_read += 1;
                    let region = entry.key.region_id.clone();
                    let seq = entry.key.sequence_id;

                    if let Some(last) = last_seq.get(&region) {
                        if seq <= *last {
                            warn!(
                                path = ?path,
                                region = %entry.key.region_display(),
                                sequence = seq,
                                last = *last,
                                "Out-of-order edit skipped"
                            );
                            stats.records_skipped += 1;
                            continue;
                        }
                    }
                    last_seq.insert(region.clone(), seq);
                    buffers.entry(region).or_default().push(entry);
                }
            }

            stats.records_written += self
                .write_batch(output_dir, &mut outputs, buffers)
                .await?;
        }

        let mut paths: Vec<PathBuf> = stream::iter(outputs.into_values().map(RegionOutput::finish))
            .buffer_unordered(self.config.writers.max(1))
            .try_collect()
            .await?;
        paths.sort();

        if let Some(archive_dir) = &self.config.archive_dir {
            tokio::fs::create_dir_all(archive_dir).await?;
            for (name, path) in &segments {
                tokio::fs::rename(path, archive_dir.join(name.file_name())).await?;
            }
            debug!(archive = ?archive_dir, segments = segments.len(), "Split sources archived");
        }

        info!(
            segments = stats.segments_read,
            records = stats.records_written,
            skipped = stats.records_skipped,
            truncated = stats.truncated_segments,
            regions = paths.len(),
            "Split complete"
        );

        stats.outputs = paths;
        Ok(stats)
    }

    /// Append each region's buffered edits to its output, concurrently.
    async fn write_batch(
        &self,
        output_dir: &Path,
        outputs: &mut HashMap<Bytes, RegionOutput>,
        buffers: HashMap<Bytes, Vec<LogEntry>>,
    ) -> Result<u64> {
        let jobs = buffers.into_iter().map(|(region, entries)| {
            let output = outputs
                .remove(&region)
                .unwrap_or_else(|| RegionOutput::new(output_dir.join(region_output_name(&region))));
            async move {
                let written = entries.len() as u64;
                let output = output.append(entries).await?;
                Ok::<_, Error>((region, output, written))
            }
        });
        // Collect first: the closure above borrows `outputs` mutably.
        let jobs: Vec<_> = jobs.collect();

        let done: Vec<(Bytes, RegionOutput, u64)> = stream::iter(jobs)
            .buffer_unordered(self.config.writers.max(1))
            .try_collect()
            .await?;

        let mut written = 0;
        for (region, output, count) in done {
            written += count;
            outputs.insert(region, output);
        }
        Ok(written)
    }
}

/// One region's output file, created on first write.
struct RegionOutput {
    path: PathBuf,
    file: Option<SegmentFile>,
}

impl RegionOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    async fn append(mut self, entries: Vec<LogEntry>) -> Result<Self> {
        let mut buf = BytesMut::new();
        for entry in &entries {
            buf.extend_from_slice(&entry.encode()?);
        }

        if self.file.is_none() {
            if tokio::fs::metadata(&self.path).await.is_ok() {
                warn!(path = ?self.path, "Removing output left by an earlier split attempt");
                tokio::fs::remove_file(&self.path).await?;
            }
            self.file = Some(SegmentFile::create(&self.path, now_ms()).await?);
        }
        if let Some(file) = self.file.as_mut() {
            file.append(&buf).await?;
        }
        Ok(self)
    }

    async fn finish(self) -> Result<PathBuf> {
        if let Some(file) = self.file {
            file.close().await?;
        }
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::compute_filename;
    use regionlog_core::{Cell, EditBatch, LogKey};
    use tempfile::TempDir;

    fn entry(region: &str, seq: u64) -> LogEntry {
        let edits: EditBatch = vec![Cell::put("row", "cf", "q", seq, "v")].into();
        LogEntry::new(LogKey::new(region.to_string(), "table", seq, seq), edits)
    }

    async fn write_source(dir: &Path, index: u64, entries: &[LogEntry]) -> PathBuf {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let path = dir.join(compute_filename("wal", index));
        let mut file = SegmentFile::create(&path, 0).await.unwrap();
        for entry in entries {
            file.append(&entry.encode().unwrap()).await.unwrap();
        }
        file.close().await.unwrap();
        path
    }

    async fn read_all(path: &Path) -> Vec<LogEntry> {
        LogReader::open(path)
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap()
            .entries
    }

    #[tokio::test]
    async fn test_split_partitions_by_region() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("dead-server");
        let output = dir.path().join("split");

        write_source(&source, 1, &[entry("a", 1), entry("b", 2), entry("a", 3)]).await;
        write_source(&source, 2, &[entry("b", 4), entry("a", 5)]).await;

        let stats = LogSplitter::default()
            .split_with_stats(&source, &output)
            .await
            .unwrap();
        assert_eq!(stats.segments_read, 2);
        assert_eq!(stats.records_read, 5);
        assert_eq!(stats.records_written, 5);
        assert_eq!(stats.outputs.len(), 2);

        let a = read_all(&output.join(region_output_name(b"a"))).await;
        let seqs: Vec<u64> = a.iter().map(|e| e.key.sequence_id).collect();
        assert_eq!(seqs, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_segments_processed_in_index_order() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");

        // Written out of order on purpose
        write_source(&source, 20, &[entry("a", 30)]).await;
        write_source(&source, 3, &[entry("a", 10)]).await;
        write_source(&source, 10, &[entry("a", 20)]).await;

        let outputs = split(&source, &output).await.unwrap();
        let seqs: Vec<u64> = read_all(&outputs[0]).await.iter().map(|e| e.key.sequence_id).collect();
        assert_eq!(seqs, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_out_of_order_edit_skipped() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");

        write_source(&source, 1, &[entry("a", 5), entry("a", 4), entry("a", 6)]).await;

        let stats = LogSplitter::default()
            .split_with_stats(&source, &output)
            .await
            .unwrap();
        assert_eq!(stats.records_skipped, 1);
        assert_eq!(stats.records_written, 2);
    }

    #[tokio::test]
    async fn test_missing_source_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let outputs = split(&dir.path().join("nothing"), &dir.path().join("out"))
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");

        let first = write_source(&source, 1, &[entry("a", 1), entry("a", 2)]).await;
        write_source(&source, 2, &[entry("a", 3)]).await;

        let len = std::fs::metadata(&first).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&first).unwrap();
        file.set_len(len - 3).unwrap();

        let stats = LogSplitter::default()
            .split_with_stats(&source, &output)
            .await
            .unwrap();
        assert_eq!(stats.truncated_segments, 1);
        assert_eq!(stats.records_written, 2);
    }

    #[tokio::test]
    async fn test_mid_file_corruption_fails_split() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");

        let path = write_source(&source, 1, &[entry("a", 1), entry("a", 2), entry("a", 3)]).await;
        let mut bytes = std::fs::read(&path).unwrap();
        let frame_len = entry("a", 1).encode().unwrap().len();
        let placeholder_len = bytes.len() - 3 * frame_len;
        // Last byte of the first entry's body
        bytes[placeholder_len + frame_len - 1] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = split(&source, &output).await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
        assert!(path.exists(), "sources stay in place on failure");
    }

    #[tokio::test]
    async fn test_sources_archived_when_configured() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");
        let archive = dir.path().join("archive");

        let path = write_source(&source, 1, &[entry("a", 1)]).await;
        let splitter = LogSplitter::new(SplitConfig {
            archive_dir: Some(archive.clone()),
            ..Default::default()
        });
        splitter.split(&source, &output).await.unwrap();

        assert!(!path.exists());
        assert!(archive.join(compute_filename("wal", 1)).exists());
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_outputs() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");
        write_source(&source, 1, &[entry("a", 1), entry("a", 2)]).await;

        split(&source, &output).await.unwrap();
        let outputs = split(&source, &output).await.unwrap();
        assert_eq!(read_all(&outputs[0]).await.len(), 2);
    }
}
