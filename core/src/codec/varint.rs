//! LEB128 variable-length integers.

use crate::error::{ArborError, ArborResult};

#[inline]
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint, returning `(value, bytes_consumed)`.
#[inline]
pub fn decode_varint(buf: &[u8]) -> ArborResult<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(ArborError::Codec("varint too long".into()));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(ArborError::Codec("truncated varint".into()))
}

/// Encoded size of `value` in bytes.
#[inline]
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}
