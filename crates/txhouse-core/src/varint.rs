//! Variable-length Integer Encoding (Varint)
//!
//! ## Varint Encoding
//! Each byte carries 7 bits of data and 1 continuation bit, so small numbers take one
//! byte and a full u64 takes at most ten.
//!
//! ## ZigZag Encoding (for signed integers)
//! Maps signed integers to unsigned so small negative numbers stay small:
//! 0 → 0, -1 → 1, 1 → 2, -2 → 3, 2 → 4, etc.
//!
//! ## Use in run files
//! String lengths are varint-prefixed, dates are zigzag day numbers, and insertion
//! sequence numbers are zigzag deltas from the previous row. Rows in a run are sorted
//! by key rather than by sequence, so those deltas can be negative.
//!
//! Decoding never panics: truncated or overlong input is reported as
//! [`Error::InvalidRun`] because varints only appear inside run files.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

const MAX_VARINT_LEN: usize = 10;

/// Encode a signed integer as a varint (ZigZag encoding)
pub fn encode_varint(buf: &mut impl BufMut, value: i64) {
    let unsigned = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint_u64(buf, unsigned);
}

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // continuation
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to a signed integer
pub fn decode_varint(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_varint_u64(buf)?;
    let value = (unsigned >> 1) as i64;
    Ok(if (unsigned & 1) != 0 { !value } else { value })
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::InvalidRun("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << (7 * i);

        if (byte & 0x80) == 0 {
            return Ok(value);
        }
    }

    Err(Error::InvalidRun("varint longer than 10 bytes".to_string()))
}

/// Size in bytes of the unsigned varint encoding of `value`.
pub fn varint_len_u64(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_signed_values() {
        for value in [0i64, 1, -1, 63, -64, 1_000_000, -1_000_000, i64::MAX, i64::MIN] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            assert_eq!(decode_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_small_values_are_one_byte() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, -1);
        assert_eq!(buf.len(), 1);

        for value in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint_u64(&mut buf, value);
            assert_eq!(buf.len(), varint_len_u64(value));
        }
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            decode_varint_u64(&mut slice),
            Err(Error::InvalidRun(_))
        ));

        let mut empty: &[u8] = &[];
        assert!(decode_varint(&mut empty).is_err());
    }

    #[test]
    fn test_overlong_input_is_an_error() {
        let bytes = [0xFFu8; 11];
        let mut slice = &bytes[..];
        assert!(decode_varint_u64(&mut slice).is_err());
    }
}
