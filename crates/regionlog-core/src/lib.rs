//! regionlog Core Types
//!
//! Data model and record codec shared by every part of the write-ahead log.
//!
//! ## Contents
//!
//! - [`LogKey`]: region, table, sequence id and write time of one record
//! - [`Cell`] / [`EditBatch`]: the mutations a record carries
//! - [`LogEntry`]: key plus batch, the unit readers hand back
//! - [`entry`]: CRC32 framing and the segment placeholder record
//! - [`varint`]: fallible varint and length-prefix helpers
//!
//! Nothing here does I/O; files, sync and rolling live in `regionlog-wal`.

pub mod edit;
pub mod entry;
pub mod error;
pub mod key;
pub mod varint;

pub use edit::{Cell, CellKind, EditBatch};
pub use entry::{LogEntry, Record};
pub use error::{Error, Result};
pub use key::LogKey;
