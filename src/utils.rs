//! Utility functions for binary parsing, encoding, and string conversion.

use crate::error::{RegistryError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::UTF_16LE;
use std::io::Cursor;

/// Offset where hive bins start (after the 4096-byte base block).
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Sentinel offset meaning "invalid" / "absent".
pub const INVALID_OFFSET: u32 = 0xFFFF_FFFF;

/// Minimum cell size, including the 4-byte length prefix.
pub const MIN_CELL_SIZE: u32 = 8;

/// Cell and HBIN sizes are always multiples of this.
pub const CELL_ALIGNMENT: u32 = 8;

/// HBIN start positions and lengths are always multiples of this.
pub const HBIN_ALIGNMENT: u32 = 4096;

/// Reads an ASCII string from a byte slice, trimming null terminators.
pub fn read_ascii_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Encodes a string as 8-bit compressed ASCII bytes (no terminator).
///
/// Non-ASCII codepoints are replaced with `?`, matching the lossy behavior
/// of `read_ascii_string` on the way back in.
pub fn write_ascii_string(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Encodes a string as UTF-16LE bytes (no terminator).
pub fn write_utf16_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Reads a fixed-length ASCII string (not null-terminated).
pub fn read_fixed_ascii(data: &[u8], len: usize) -> String {
    data.iter()
        .take(len)
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Writes a u32 to a byte slice at the given offset.
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }
    let mut cursor = Cursor::new(&mut data[offset..offset + 4]);
    cursor.write_u32::<LittleEndian>(value)?;
    Ok(())
}

/// Writes a u16 to a byte slice at the given offset.
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }
    let mut cursor = Cursor::new(&mut data[offset..offset + 2]);
    cursor.write_u16::<LittleEndian>(value)?;
    Ok(())
}

/// Writes an i32 to a byte slice at the given offset.
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) -> Result<()> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }
    let mut cursor = Cursor::new(&mut data[offset..offset + 4]);
    cursor.write_i32::<LittleEndian>(value)?;
    Ok(())
}

/// Calculates the XOR checksum for the first 508 bytes of the base block.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    for i in (0..0x1FC).step_by(4) {
        if i + 4 <= data.len() {
            if let Ok(dword) = read_u32_le(data, i) {
                checksum ^= dword;
            }
        }
    }

    checksum
}

/// Converts a relative cell offset to an absolute hive offset.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or(RegistryError::InvalidOffset {
            offset: cell_offset,
            hive_size: 0,
        })
}

/// Converts an absolute hive offset to a relative cell offset.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    if absolute_offset < HBIN_START_OFFSET {
        return Err(RegistryError::InvalidFormat(format!(
            "Absolute offset {:#x} is before hbin start",
            absolute_offset
        )));
    }
    Ok(absolute_offset - HBIN_START_OFFSET)
}

/// Rounds `size` up to the next multiple of `CELL_ALIGNMENT`, with a floor
/// of `MIN_CELL_SIZE`.
pub fn round_cell_size(size: u32) -> u32 {
    let rounded = size.div_ceil(CELL_ALIGNMENT) * CELL_ALIGNMENT;
    rounded.max(MIN_CELL_SIZE)
}

/// Rounds `size` up to the next multiple of `HBIN_ALIGNMENT`.
pub fn round_hbin_size(size: u32) -> u32 {
    size.div_ceil(HBIN_ALIGNMENT) * HBIN_ALIGNMENT
}

/// Computes the 4-byte hash hint used by `lf`/`lh` subkey list entries: the
/// first four bytes of the child name, case preserved, right-zero-padded if
/// shorter than four bytes. Purely advisory (spec §4.3).
pub fn name_hint(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hint = [0u8; 4];
    let n = bytes.len().min(4);
    hint[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(hint)
}

/// Case-folds a stored name hint the same way [`ascii_lower`] folds names,
/// so a hint computed from a lower-cased wanted name can be compared
/// against a hint read off disk (which is case-preserved) without the
/// comparison itself becoming case-sensitive. A fold-matched hint still
/// requires a full-name decode to confirm — hints can collide.
pub fn fold_hint(hint: u32) -> u32 {
    u32::from_le_bytes(hint.to_le_bytes().map(|b| b.to_ascii_lowercase()))
}

/// Lower-cases a name the way lookups compare it: ASCII-only folding,
/// leaving bytes above 0x7F untouched (spec §4.3).
pub fn ascii_lower(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_lowercase() } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ascii_string() {
        let data = b"Hello";
        assert_eq!(read_ascii_string(data), "Hello");

        let data_with_null = b"Hello\0\0";
        assert_eq!(read_ascii_string(data_with_null), "Hello");
    }

    #[test]
    fn test_write_read_utf16_roundtrip() {
        let encoded = write_utf16_string("Soft\u{e9}ware");
        let decoded = read_utf16_string(&encoded, 0).unwrap();
        assert_eq!(decoded, "Soft\u{e9}ware");
    }

    #[test]
    fn test_write_ascii_replaces_non_ascii() {
        let encoded = write_ascii_string("caf\u{e9}");
        assert_eq!(encoded, b"caf?");
    }

    #[test]
    fn test_offset_conversion() {
        assert_eq!(cell_offset_to_absolute(0).unwrap(), 0x1000);
        assert_eq!(cell_offset_to_absolute(0x20).unwrap(), 0x1020);
        assert_eq!(absolute_to_cell_offset(0x1000).unwrap(), 0);
        assert_eq!(absolute_to_cell_offset(0x1020).unwrap(), 0x20);
    }

    #[test]
    fn test_round_cell_size() {
        assert_eq!(round_cell_size(1), MIN_CELL_SIZE);
        assert_eq!(round_cell_size(8), 8);
        assert_eq!(round_cell_size(9), 16);
        assert_eq!(round_cell_size(0), MIN_CELL_SIZE);
    }

    #[test]
    fn test_round_hbin_size() {
        assert_eq!(round_hbin_size(1), 4096);
        assert_eq!(round_hbin_size(4096), 4096);
        assert_eq!(round_hbin_size(4097), 8192);
    }

    #[test]
    fn test_name_hint_pads_short_names() {
        assert_eq!(name_hint("Ab"), u32::from_le_bytes([b'A', b'b', 0, 0]));
        assert_eq!(name_hint("Abcdef"), u32::from_le_bytes([b'A', b'b', b'c', b'd']));
    }

    #[test]
    fn test_write_read_u32_roundtrip() {
        let mut buf = [0u8; 4];
        write_u32_le(&mut buf, 0, 0xDEADBEEF).unwrap();
        assert_eq!(read_u32_le(&buf, 0).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_ascii_lower_folds_only_ascii() {
        assert_eq!(ascii_lower("SOFTWARE"), "software");
        assert_eq!(ascii_lower("Soft\u{c9}"), "soft\u{c9}");
    }
}
