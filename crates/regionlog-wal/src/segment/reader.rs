//! Segment Reader
//!
//! Forward-only, single-pass reader over one segment file. The placeholder
//! record is validated and skipped; every call to [`LogReader::next_entry`]
//! yields the next `LogEntry` or `None` at clean end-of-file.
//!
//! ## Damage classification
//!
//! ```text
//! ... [frame k-1][partial header]EOF               -> TruncatedRecord (torn tail)
//! ... [frame k-1][zero bytes ............]EOF      -> TruncatedRecord (torn tail)
//! ... [frame k-1][good header, body ..... EOF      -> TruncatedRecord (torn tail)
//! ... [frame k-1][frame k, bad body CRC]EOF        -> TruncatedRecord (torn tail)
//! ... [frame k-1][bad header CRC] ...              -> CorruptRecord
//! ... [frame k-1][frame k, bad CRC][frame k+1] ... -> CorruptRecord
//! ```
//!
//! A crash mid-write can only damage the end of the file, so damage with
//! valid-looking data after it means the file itself is corrupt. The body
//! length is trusted only once the header checksum holds, so a flipped
//! length bit mid-file is reported as corruption rather than a torn tail.
//! Callers tell the two apart with `Error::is_tail_damage`.
//!
//! The file length is captured when the reader opens. Bytes appended by a
//! live writer afterwards are not visited.
//!
//! After any error the reader is exhausted and returns `Ok(None)`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, warn};

use regionlog_core::entry::{decode_body, FrameHeader, Record, FRAME_HEADER_LEN};
use regionlog_core::LogEntry;

use crate::error::{Error, Result};

/// Whether a file ended cleanly or with a torn final record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Clean,
    Truncated { offset: u64 },
}

/// Everything readable from one segment.
#[derive(Debug)]
pub struct ReadOutcome {
    pub entries: Vec<LogEntry>,
    pub tail: TailState,
}

pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    file_len: u64,
    offset: u64,
    placeholder_checked: bool,
    exhausted: bool,
}

impl LogReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let file_len = file.metadata().await?.len();

        Ok(Self {
            path,
            reader: BufReader::new(file),
            file_len,
            offset: 0,
            placeholder_checked: false,
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next frame.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Next entry, `Ok(None)` at clean end-of-file.
    pub async fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        if self.exhausted {
            return Ok(None);
        }
        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.exhausted = true;
        }
        result
    }

    async fn advance(&mut self) -> Result<Option<LogEntry>> {
        if !self.placeholder_checked {
            self.placeholder_checked = true;
            let start = self.offset;
            match self.read_record().await? {
                None => {
                    debug!(path = ?self.path, "Empty segment");
                    return Ok(None);
                }
                Some(Record::Placeholder { .. }) => {}
                Some(Record::Entry(_)) => {
                    return Err(self.corrupt(start, "segment does not start with a placeholder"));
                }
            }
        }

        let start = self.offset;
        match self.read_record().await? {
            None => Ok(None),
            Some(Record::Entry(entry)) => Ok(Some(entry)),
            Some(Record::Placeholder { .. }) => {
                Err(self.corrupt(start, "placeholder record after segment start"))
            }
        }
    }

    async fn read_record(&mut self) -> Result<Option<Record>> {
        let start = self.offset;
        let remaining = self.file_len - start;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_HEADER_LEN as u64 {
            return Err(self.truncated(start));
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        self.reader.read_exact(&mut header).await?;
        self.offset += FRAME_HEADER_LEN as u64;

        let header = match FrameHeader::parse(header) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Zero-filled blocks past the last complete write
                if header.iter().all(|b| *b == 0) && self.rest_is_zero().await? {
                    return Err(self.truncated(start));
                }
                return Err(self.corrupt(start, e));
            }
        };
        if header.body_len as u64 > remaining - FRAME_HEADER_LEN as u64 {
            // Frame runs past end-of-file
            return Err(self.truncated(start));
        }

        let mut body = vec![0u8; header.body_len];
        self.reader.read_exact(&mut body).await?;
        self.offset += header.body_len as u64;

        if let Err(e) = header.verify(&body) {
            if self.offset == self.file_len {
                return Err(self.truncated(start));
            }
            return Err(self.corrupt(start, e));
        }

        let record = decode_body(Bytes::from(body)).map_err(|e| self.corrupt(start, e))?;
        Ok(Some(record))
    }

    /// Consume the rest of the file, reporting whether it is all zeros.
    async fn rest_is_zero(&mut self) -> Result<bool> {
        let mut rest = Vec::new();
        let limit = self.file_len - self.offset;
        (&mut self.reader).take(limit).read_to_end(&mut rest).await?;
        self.offset = self.file_len;
        Ok(rest.iter().all(|b| *b == 0))
    }

    fn truncated(&self, offset: u64) -> Error {
        warn!(path = ?self.path, offset = offset, "Truncated record at end of segment");
        Error::TruncatedRecord {
            path: self.path.clone(),
            offset,
        }
    }

    fn corrupt(&self, offset: u64, reason: impl ToString) -> Error {
        Error::CorruptRecord {
            path: self.path.clone(),
            offset,
            reason: reason.to_string(),
        }
    }

    /// Read every entry. A torn tail ends the read and is reported in
    /// `tail`; any other damage is an error.
    pub async fn read_to_end(mut self) -> Result<ReadOutcome> {
        let mut entries = Vec::new();
        loop {
            match self.next_entry().await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {
                    return Ok(ReadOutcome {
                        entries,
                        tail: TailState::Clean,
                    })
                }
                Err(Error::TruncatedRecord { offset, .. }) => {
                    return Ok(ReadOutcome {
                        entries,
                        tail: TailState::Truncated { offset },
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The reader as a stream of entries.
    pub fn into_stream(self) -> impl Stream<Item = Result<LogEntry>> {
        stream::try_unfold(self, |mut reader| async move {
            let next = reader.next_entry().await?;
            Ok::<_, Error>(next.map(|entry| (entry, reader)))
        })
    }
}
