//! Codec Error Types
//!
//! Errors raised while encoding or decoding log records.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `HeaderCrcMismatch`: frame header (length and body checksum) is damaged
//! - `CrcMismatch`: record body does not match its stored checksum
//! - `InvalidRecord`: body is structurally malformed (short buffer, bad varint, trailing bytes)
//! - `InvalidCellKind`: unknown cell type byte
//! - `RecordTooLarge`: a body larger than the codec accepts, claimed by a header or offered for encoding
//!
//! ### Placeholder Errors
//! - `InvalidMagic`: first record of a segment is not the `RLOG` placeholder
//! - `UnsupportedVersion`: placeholder written by a newer format version
//!
//! Decoding never panics on hostile input; every short read surfaces as
//! `InvalidRecord`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Header CRC mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    HeaderCrcMismatch { expected: u32, actual: u32 },

    #[error("CRC mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),

    #[error("Invalid cell kind: {0}")]
    InvalidCellKind(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
