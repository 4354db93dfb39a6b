//! Log Records and Framing
//!
//! A segment file is a sequence of CRC-protected frames. The first frame of
//! every segment is a placeholder that carries the format magic and version;
//! every frame after it holds one `LogEntry`.
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────────┬─────────────┬───────────────┬──────────────────────┐
//! │ Body Length │ CRC32(body) │ CRC32(0..8)   │ Body                 │
//! │ (4 bytes LE)│ (4 bytes LE)│ (4 bytes LE)  │ (Body Length bytes)  │
//! └─────────────┴─────────────┴───────────────┴──────────────────────┘
//!
//! Body:
//! ┌──────┬──────────┬────────────┬──────────┬──────────┬───────────────┐
//! │ kind │ sequence │ write_time │ region   │ table    │ payload       │
//! │ (u8) │ (varint) │ (varint)   │ (len+N)  │ (len+N)  │               │
//! └──────┴──────────┴────────────┴──────────┴──────────┴───────────────┘
//!
//! kind 0 (placeholder): payload = "RLOG" + version (u16 LE), sequence 0
//! kind 1 (edit):        payload = encoded EditBatch
//! ```
//!
//! The length prefix lets a reader skip to the next frame without parsing
//! the body. The header checksum covers the length and body checksum, so a
//! damaged length is caught before it is trusted: only a header that checks
//! out and still runs past end-of-file counts as a torn write.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::edit::EditBatch;
use crate::error::{Error, Result};
use crate::key::LogKey;
use crate::varint::{
    decode_varint_u64, encode_varint_u64, get_len_prefixed, put_len_prefixed, varint_len,
};

/// Magic carried by the placeholder record.
pub const PLACEHOLDER_MAGIC: &[u8; 4] = b"RLOG";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Bytes of length, body checksum and header checksum preceding every body.
pub const FRAME_HEADER_LEN: usize = 12;

/// Upper bound on a single record body (64 MiB).
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

const KIND_PLACEHOLDER: u8 = 0;
const KIND_EDIT: u8 = 1;

/// One decoded record: the key and the batch of edits it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: LogKey,
    pub edits: EditBatch,
}

impl LogEntry {
    pub fn new(key: LogKey, edits: EditBatch) -> Self {
        Self { key, edits }
    }

    /// Encode this entry as a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        let edits = self.edits.encode();
        let mut buf = BytesMut::new();
        encode_edit_frame(
            &mut buf,
            self.key.sequence_id,
            self.key.write_time,
            &self.key.region_id,
            &self.key.table_id,
            &edits,
        )?;
        Ok(buf.freeze())
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// First record of every segment
    Placeholder { write_time: u64, version: u16 },
    Entry(LogEntry),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: usize,
    pub checksum: u32,
}

impl FrameHeader {
    /// Validate the header checksum, then the declared body length.
    pub fn parse(bytes: [u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let actual = crc32fast::hash(&bytes[..8]);
        if stored != actual {
            return Err(Error::HeaderCrcMismatch {
                expected: stored,
                actual,
            });
        }

        let body_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if body_len > MAX_RECORD_SIZE {
            return Err(Error::RecordTooLarge(body_len));
        }
        if body_len == 0 {
            return Err(Error::InvalidRecord("zero-length record".to_string()));
        }

        Ok(Self { body_len, checksum })
    }

    /// Check `body` against the stored checksum.
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(body);
        if actual != self.checksum {
            return Err(Error::CrcMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Body length of an edit record with the given field sizes.
pub fn edit_body_len(
    sequence_id: u64,
    write_time: u64,
    region_len: usize,
    table_len: usize,
    edits_len: usize,
) -> usize {
    1 + varint_len(sequence_id)
        + varint_len(write_time)
        + varint_len(region_len as u64)
        + region_len
        + varint_len(table_len as u64)
        + table_len
        + edits_len
}

/// Encode an edit record whose batch has already been serialized.
///
/// The writer task uses this so that batch encoding happens on the caller's
/// task and only the key is encoded once the sequence id is known. Fails
/// with `RecordTooLarge`, leaving `buf` untouched, when the body would
/// exceed [`MAX_RECORD_SIZE`].
pub fn encode_edit_frame(
    buf: &mut BytesMut,
    sequence_id: u64,
    write_time: u64,
    region_id: &[u8],
    table_id: &[u8],
    encoded_edits: &[u8],
) -> Result<()> {
    let body_len = edit_body_len(
        sequence_id,
        write_time,
        region_id.len(),
        table_id.len(),
        encoded_edits.len(),
    );
    if body_len > MAX_RECORD_SIZE {
        return Err(Error::RecordTooLarge(body_len));
    }

    let mut body = BytesMut::with_capacity(body_len);
    body.put_u8(KIND_EDIT);
    encode_varint_u64(&mut body, sequence_id);
    encode_varint_u64(&mut body, write_time);
    put_len_prefixed(&mut body, region_id);
    put_len_prefixed(&mut body, table_id);
    body.put_slice(encoded_edits);

    put_frame(buf, &body);
    Ok(())
}

/// Encode the placeholder that opens every segment.
pub fn encode_placeholder(write_time: u64) -> Bytes {
    let mut body = BytesMut::with_capacity(16);
    body.put_u8(KIND_PLACEHOLDER);
    encode_varint_u64(&mut body, 0);
    encode_varint_u64(&mut body, write_time);
    put_len_prefixed(&mut body, &[]);
    put_len_prefixed(&mut body, &[]);
    body.put_slice(PLACEHOLDER_MAGIC);
    body.put_u16_le(FORMAT_VERSION);

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    put_frame(&mut buf, &body);
    buf.freeze()
}

/// Callers bound `body` by `MAX_RECORD_SIZE`, so its length fits a u32.
fn put_frame(buf: &mut BytesMut, body: &[u8]) {
    debug_assert!(body.len() <= MAX_RECORD_SIZE);
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[4..8].copy_from_slice(&crc32fast::hash(body).to_le_bytes());
    let header_crc = crc32fast::hash(&header[..8]);
    header[8..].copy_from_slice(&header_crc.to_le_bytes());

    buf.reserve(FRAME_HEADER_LEN + body.len());
    buf.put_slice(&header);
    buf.put_slice(body);
}

/// Decode a verified frame body.
pub fn decode_body(mut body: Bytes) -> Result<Record> {
    if !body.has_remaining() {
        return Err(Error::InvalidRecord("empty body".to_string()));
    }
    let kind = body.get_u8();
    let sequence_id = decode_varint_u64(&mut body)?;
    let write_time = decode_varint_u64(&mut body)?;
    let region_id = get_len_prefixed(&mut body)?;
    let table_id = get_len_prefixed(&mut body)?;

    match kind {
        KIND_PLACEHOLDER => {
            if body.remaining() != PLACEHOLDER_MAGIC.len() + 2 {
                return Err(Error::InvalidMagic);
            }
            if &body[..4] != PLACEHOLDER_MAGIC {
                return Err(Error::InvalidMagic);
            }
            body.advance(4);
            let version = body.get_u16_le();
            if version > FORMAT_VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            Ok(Record::Placeholder {
                write_time,
                version,
            })
        }
        KIND_EDIT => {
            let edits = EditBatch::decode(&mut body)?;
            if body.has_remaining() {
                return Err(Error::InvalidRecord(format!(
                    "{} trailing bytes after edit batch",
                    body.remaining()
                )));
            }
            Ok(Record::Entry(LogEntry {
                key: LogKey {
                    region_id,
                    table_id,
                    sequence_id,
                    write_time,
                },
                edits,
            }))
        }
        other => Err(Error::InvalidRecord(format!("unknown record kind {}", other))),
    }
}

/// Decode one complete frame from the front of `buf`.
///
/// Fails with `InvalidRecord` when `buf` does not hold the whole frame.
pub fn decode_frame(buf: &mut Bytes) -> Result<Record> {
    if buf.remaining() < FRAME_HEADER_LEN {
        return Err(Error::InvalidRecord("truncated frame header".to_string()));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    buf.copy_to_slice(&mut header);
    let header = FrameHeader::parse(header)?;

    if buf.remaining() < header.body_len {
        return Err(Error::InvalidRecord(format!(
            "frame body needs {} bytes, {} available",
            header.body_len,
            buf.remaining()
        )));
    }
    let body = buf.split_to(header.body_len);
    header.verify(&body)?;
    decode_body(body)
}
