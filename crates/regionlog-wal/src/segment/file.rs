//! Segment File Handle
//!
//! Thin wrapper over an open segment file. Creating a segment writes and
//! syncs the placeholder record before anything else can be appended, so a
//! reader never sees a segment without one (an empty file aside, which a
//! crash between create and the first write can leave behind).

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use regionlog_core::entry::encode_placeholder;

use crate::error::Result;

#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl SegmentFile {
    /// Create a new segment at `path`. Fails if the file already exists.
    pub async fn create(path: &Path, write_time: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let mut segment = Self {
            path: path.to_path_buf(),
            file,
            size: 0,
        };
        segment.append(&encode_placeholder(write_time)).await?;
        segment.sync().await?;
        Ok(segment)
    }

    /// Hand `data` to the OS. Not durable until [`sync`](Self::sync).
    pub async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// fdatasync: data only, metadata is settled by [`close`](Self::close).
    pub async fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data().await
    }

    /// Full fsync, then drop the handle.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regionlog_core::entry::{decode_frame, Record};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_writes_placeholder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.00000000000000000001");

        let segment = SegmentFile::create(&path, 77).await.unwrap();
        let size = segment.size();
        segment.close().await.unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes.len() as u64, size);

        let mut buf = bytes::Bytes::from(bytes);
        assert!(matches!(
            decode_frame(&mut buf).unwrap(),
            Record::Placeholder { write_time: 77, .. }
        ));
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.00000000000000000001");
        tokio::fs::write(&path, b"existing").await.unwrap();

        assert!(SegmentFile::create(&path, 0).await.is_err());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"existing");
    }
}
