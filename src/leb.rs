//! LEB128 decoding, shared by the DWARF CFI reader and the
//! `LC_FUNCTION_STARTS` delta stream.

use crate::error::{Error, Result};

/// Decodes an unsigned LEB128 value from `buf` starting at `*offset`,
/// advancing the offset past the encoded bytes.
pub(crate) fn read_uleb128(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    loop {
        let byte = *buf.get(*offset).ok_or(Error::Invalid)?;
        *offset += 1;

        if shift >= 64 {
            return Err(Error::Invalid);
        }

        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Decodes a signed LEB128 value from `buf` starting at `*offset`.
pub(crate) fn read_sleb128(buf: &[u8], offset: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;

    loop {
        let byte = *buf.get(*offset).ok_or(Error::Invalid)?;
        *offset += 1;

        if shift >= 64 {
            return Err(Error::Invalid);
        }

        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            // Sign extend
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
}
