//! Variable-length Integer Encoding (Varint)
//!
//! Unsigned LEB128-style varints: 7 data bits per byte, high bit set when
//! more bytes follow. Sequence ids, timestamps and length prefixes in a log
//! record are all small in practice, so most encode in 1-3 bytes.
//!
//! Decoding is fallible. Log segments are read back after crashes, so a
//! truncated or garbled varint must surface as an error rather than a panic.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

/// Longest valid encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for _ in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::InvalidRecord("truncated varint".to_string()));
        }
        let byte = buf.get_u8();

        // The tenth byte may only carry the single remaining bit.
        if shift == 63 && byte > 1 {
            return Err(Error::InvalidRecord("varint overflows u64".to_string()));
        }
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(value);
        }
        shift += 7;
    }

    Err(Error::InvalidRecord("varint too long".to_string()))
}

/// Number of bytes `value` occupies once encoded.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Write a varint length followed by the bytes themselves.
pub fn put_len_prefixed(buf: &mut impl BufMut, data: &[u8]) {
    encode_varint_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read a length-prefixed byte string without copying.
pub fn get_len_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    let len = decode_varint_u64(buf)?;
    if len > buf.remaining() as u64 {
        return Err(Error::InvalidRecord(format!(
            "length prefix {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_u64() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 12345);

        let mut cursor = buf.as_ref();
        let decoded = decode_varint_u64(&mut cursor).unwrap();
        assert_eq!(decoded, 12345);
    }

    #[test]
    fn test_varint_u64_max() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);

        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint_u64(&mut cursor).unwrap(), u64::MAX);
        assert_eq!(cursor.len(), 0);
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for value in [0u64, 1, 127, 128, 16383, 16384, 1 << 35, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint_u64(&mut buf, value);
            assert_eq!(varint_len(value), buf.len(), "value {}", value);
        }
    }

    // ---------------------------------------------------------------
    // Damaged input
    // ---------------------------------------------------------------

    #[test]
    fn test_truncated_varint_is_error() {
        // Continuation bit set but no following byte
        let mut cursor: &[u8] = &[0x80];
        assert!(matches!(
            decode_varint_u64(&mut cursor),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_empty_buffer_is_error() {
        let mut cursor: &[u8] = &[];
        assert!(decode_varint_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_overlong_varint_is_error() {
        let mut cursor: &[u8] = &[0xFF; 11];
        assert!(decode_varint_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_overflowing_tenth_byte_is_error() {
        let mut bytes = vec![0xFF; 9];
        bytes.push(0x02);
        let mut cursor: &[u8] = &bytes;
        assert!(decode_varint_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_len_prefixed() {
        let mut buf = BytesMut::new();
        put_len_prefixed(&mut buf, b"region-a");
        put_len_prefixed(&mut buf, b"");

        let mut bytes = buf.freeze();
        assert_eq!(get_len_prefixed(&mut bytes).unwrap(), Bytes::from("region-a"));
        assert_eq!(get_len_prefixed(&mut bytes).unwrap(), Bytes::new());
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_len_prefix_past_end_is_error() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 50);
        buf.put_slice(b"short");

        let mut bytes = buf.freeze();
        assert!(get_len_prefixed(&mut bytes).is_err());
    }
}
