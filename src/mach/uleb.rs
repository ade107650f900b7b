//! LEB128 readers for the linkedit opcode streams and the export trie.
//! Standard 7-bits-per-byte little-endian groups, with overflow checks; a
//! stream that runs off the end of its blob is malformed, not short.

use crate::error::{Error, Result};

/// Reads a ULEB128 from `bytes` at `offset`, advancing `offset` past it.
pub fn read_uleb128(bytes: &[u8], offset: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| Error::Malformed("uleb128 extends past end of stream".into()))?;
        *offset += 1;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(Error::Malformed("uleb128 too big for uint64".into()));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Reads a SLEB128 from `bytes` at `offset`, advancing `offset` past it.
pub fn read_sleb128(bytes: &[u8], offset: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| Error::Malformed("sleb128 extends past end of stream".into()))?;
        *offset += 1;
        if shift >= 64 {
            return Err(Error::Malformed("sleb128 too big for int64".into()));
        }
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            // sign extend if the final group's sign bit is set
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
}

/// Appends `value` to `out` as a ULEB128.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Appends `value` to `out` as a SLEB128.
pub fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if !done {
            byte |= 0x80;
        }
        out.push(byte);
        if done {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb_roundtrip(value: u64) {
        let mut bytes = Vec::new();
        write_uleb128(&mut bytes, value);
        let mut offset = 0;
        assert_eq!(read_uleb128(&bytes, &mut offset).unwrap(), value);
        assert_eq!(offset, bytes.len());
    }

    fn sleb_roundtrip(value: i64) {
        let mut bytes = Vec::new();
        write_sleb128(&mut bytes, value);
        let mut offset = 0;
        assert_eq!(read_sleb128(&bytes, &mut offset).unwrap(), value);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn uleb128_roundtrips() {
        for value in [0, 1, 0x7f, 0x80, 0x3fff, 0x4000, u64::MAX] {
            uleb_roundtrip(value);
        }
    }

    #[test]
    fn sleb128_roundtrips() {
        for value in [0, 1, -1, 63, -64, 64, -65, i64::MAX, i64::MIN] {
            sleb_roundtrip(value);
        }
    }

    #[test]
    fn truncated_uleb128_is_malformed() {
        let bytes = [0x80u8, 0x80];
        let mut offset = 0;
        assert!(read_uleb128(&bytes, &mut offset).is_err());
    }

    #[test]
    fn oversized_uleb128_is_malformed() {
        // eleven continuation groups cannot fit in 64 bits
        let bytes = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x3];
        let mut offset = 0;
        assert!(read_uleb128(&bytes, &mut offset).is_err());
    }
}
