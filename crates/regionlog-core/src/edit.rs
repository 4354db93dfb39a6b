//! Edit Batches
//!
//! An `EditBatch` is the ordered list of cells one caller writes to one
//! region in a single append. The log never splits or reorders a batch:
//! it is encoded as one record and replayed as one unit.
//!
//! ## Cell encoding
//!
//! ```text
//! [varint cell_count]
//! per cell:
//! ┌──────┬─────────┬────────────┬───────────────┬─────────────┬──────────┐
//! │ kind │ row     │ family     │ qualifier     │ timestamp   │ value    │
//! │ (u8) │(len+N)  │(len+N)     │(len+N)        │(varint)     │(len+N)   │
//! └──────┴─────────┴────────────┴───────────────┴─────────────┴──────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::varint::{decode_varint_u64, encode_varint_u64, get_len_prefixed, put_len_prefixed};

/// Type of mutation a cell carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Put,
    Delete,
    DeleteColumn,
    DeleteFamily,
}

impl CellKind {
    pub fn as_u8(self) -> u8 {
        match self {
            CellKind::Put => 4,
            CellKind::Delete => 8,
            CellKind::DeleteColumn => 12,
            CellKind::DeleteFamily => 14,
        }
    }
}

impl TryFrom<u8> for CellKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(CellKind::Put),
            8 => Ok(CellKind::Delete),
            12 => Ok(CellKind::DeleteColumn),
            14 => Ok(CellKind::DeleteFamily),
            other => Err(Error::InvalidCellKind(other)),
        }
    }
}

/// A single versioned cell mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub row: Bytes,
    pub family: Bytes,
    pub qualifier: Bytes,
    /// Cell version, milliseconds since epoch
    pub timestamp: u64,
    pub value: Bytes,
    pub kind: CellKind,
}

impl Cell {
    pub fn put(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        timestamp: u64,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            value: value.into(),
            kind: CellKind::Put,
        }
    }

    pub fn delete(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        timestamp: u64,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            value: Bytes::new(),
            kind: CellKind::Delete,
        }
    }

    /// Estimate the size of this cell in bytes
    pub fn estimated_size(&self) -> usize {
        1 + self.row.len() + self.family.len() + self.qualifier.len() + 8 + self.value.len()
    }
}

/// Ordered group of cells appended atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBatch {
    cells: Vec<Cell>,
}

impl EditBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        self.cells.iter().map(Cell::estimated_size).sum()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        encode_varint_u64(buf, self.cells.len() as u64);
        for cell in &self.cells {
            buf.put_u8(cell.kind.as_u8());
            put_len_prefixed(buf, &cell.row);
            put_len_prefixed(buf, &cell.family);
            put_len_prefixed(buf, &cell.qualifier);
            encode_varint_u64(buf, cell.timestamp);
            put_len_prefixed(buf, &cell.value);
        }
    }

    /// Encode the batch on its own, ready to be framed by the writer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.estimated_size() + 16);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode a batch, consuming exactly the bytes it occupies.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let count = decode_varint_u64(buf)?;
        // Every cell takes at least 6 bytes, which bounds the allocation.
        if count > (buf.remaining() / 6) as u64 {
            return Err(Error::InvalidRecord(format!(
                "cell count {} exceeds remaining {} bytes",
                count,
                buf.remaining()
            )));
        }

        let mut cells = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if !buf.has_remaining() {
                return Err(Error::InvalidRecord("truncated cell".to_string()));
            }
            let kind = CellKind::try_from(buf.get_u8())?;
            let row = get_len_prefixed(buf)?;
            let family = get_len_prefixed(buf)?;
            let qualifier = get_len_prefixed(buf)?;
            let timestamp = decode_varint_u64(buf)?;
            let value = get_len_prefixed(buf)?;
            cells.push(Cell {
                row,
                family,
                qualifier,
                timestamp,
                value,
                kind,
            });
        }

        Ok(Self { cells })
    }
}

impl From<Vec<Cell>> for EditBatch {
    fn from(cells: Vec<Cell>) -> Self {
        Self::with_cells(cells)
    }
}

impl FromIterator<Cell> for EditBatch {
    fn from_iter<I: IntoIterator<Item = Cell>>(iter: I) -> Self {
        Self::with_cells(iter.into_iter().collect())
    }
}
