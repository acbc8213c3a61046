//! Registry hive base block (header) parsing and in-place mutation.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, and
//! the root key cell offset. [`BaseBlock`] is a read-only snapshot parsed
//! from bytes; the field offset constants below are reused by
//! [`crate::transaction`] to mutate the live buffer directly, since the
//! buffer (not this struct) is the source of truth during a session.

use crate::error::{RegistryError, Result};
use crate::utils::{calculate_checksum, read_fixed_ascii, read_u32_le, write_u32_le};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the primary sequence number.
pub(crate) const PRIMARY_SEQ_OFFSET: usize = 0x04;
/// Offset of the secondary sequence number.
pub(crate) const SECONDARY_SEQ_OFFSET: usize = 0x08;
/// Offset of the last-written FILETIME (8 bytes).
pub(crate) const LAST_WRITTEN_OFFSET: usize = 0x0C;
/// Offset of the root cell offset field.
pub(crate) const ROOT_CELL_OFFSET_OFFSET: usize = 0x24;
/// Offset of the hive length field.
pub(crate) const HIVE_LENGTH_OFFSET: usize = 0x28;
/// Offset of the file name field.
const FILE_NAME_OFFSET: usize = 0x30;
/// Length of the file name field (64 UTF-16LE characters = 128 bytes).
const FILE_NAME_LENGTH: usize = 128;
/// Offset of the checksum field in the base block.
pub(crate) const CHECKSUM_OFFSET: usize = 0x1FC;

const _: () = assert!(FILE_NAME_OFFSET + FILE_NAME_LENGTH <= CHECKSUM_OFFSET);

/// Registry hive base block header.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf" (0x66676572).
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset to root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of hive data in bytes.
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 64 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR of first 508 bytes).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        let primary_sequence = read_u32_le(data, PRIMARY_SEQ_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SECONDARY_SEQ_OFFSET)?;

        let last_written = u64::from(read_u32_le(data, LAST_WRITTEN_OFFSET)?)
            | (u64::from(read_u32_le(data, LAST_WRITTEN_OFFSET + 4)?) << 32);

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, ROOT_CELL_OFFSET_OFFSET)?;
        let hive_length = read_u32_le(data, HIVE_LENGTH_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name_bytes = &data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let file_name = read_fixed_ascii(file_name_bytes, 64);

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        if major_version != 1 || minor_version < 3 || minor_version > 6 {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Writes a pristine base block for a brand-new, empty hive into
    /// `data[0..BASE_BLOCK_SIZE]`. `root_cell_offset` is the cell offset of
    /// the already-allocated root NK; `hive_length` is the total size of
    /// the HBIN area.
    pub fn format_new(data: &mut [u8], root_cell_offset: u32, hive_length: u32) -> Result<()> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        data[..BASE_BLOCK_SIZE].fill(0);
        data[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(data, PRIMARY_SEQ_OFFSET, 1)?;
        write_u32_le(data, SECONDARY_SEQ_OFFSET, 1)?;
        write_filetime_now(data, LAST_WRITTEN_OFFSET)?;
        write_u32_le(data, 0x14, 1)?; // major_version
        write_u32_le(data, 0x18, 5)?; // minor_version
        write_u32_le(data, 0x1C, 0)?; // file_type
        write_u32_le(data, 0x20, 1)?; // file_format
        write_u32_le(data, ROOT_CELL_OFFSET_OFFSET, root_cell_offset)?;
        write_u32_le(data, HIVE_LENGTH_OFFSET, hive_length)?;
        write_u32_le(data, 0x2C, 1)?; // clustering_factor

        let checksum = calculate_checksum(&data[..BASE_BLOCK_SIZE]);
        write_u32_le(data, CHECKSUM_OFFSET, checksum)?;
        Ok(())
    }

    /// Returns true if the hive is in a consistent state.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        const FILETIME_UNIX_DIFF: i64 = 11644473600;

        let seconds = (self.last_written / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
        let nanos = ((self.last_written % 10_000_000) * 100) as u32;

        chrono::DateTime::from_timestamp(seconds, nanos)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}

/// Converts a `SystemTime` to a Windows FILETIME (100ns intervals since
/// 1601-01-01) and writes it as two little-endian u32s at `offset`.
pub(crate) fn write_filetime_now(data: &mut [u8], offset: usize) -> Result<()> {
    const FILETIME_UNIX_DIFF_100NS: u64 = 11_644_473_600 * 10_000_000;

    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let filetime = since_epoch.as_nanos() as u64 / 100 + FILETIME_UNIX_DIFF_100NS;

    write_u32_le(data, offset, (filetime & 0xFFFF_FFFF) as u32)?;
    write_u32_le(data, offset + 4, (filetime >> 32) as u32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_block_size() {
        assert_eq!(BASE_BLOCK_SIZE, 4096);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            RegistryError::InvalidSignature { .. }
        ));
    }

    #[test]
    fn test_too_small() {
        let data = vec![0u8; 100];
        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::HiveTooSmall { .. }));
    }

    #[test]
    fn test_format_new_is_consistent_and_parses() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        BaseBlock::format_new(&mut data, 0x20, 4096).unwrap();

        let parsed = BaseBlock::parse(&data).unwrap();
        assert!(parsed.is_consistent());
        assert_eq!(parsed.root_cell_offset, 0x20);
        assert_eq!(parsed.hive_length, 4096);
        assert_eq!(parsed.major_version, 1);
        assert_eq!(parsed.minor_version, 5);
    }

    #[test]
    fn test_last_written_datetime_is_recent() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        BaseBlock::format_new(&mut data, 0x20, 4096).unwrap();
        let parsed = BaseBlock::parse(&data).unwrap();

        let dt = parsed.last_written_datetime().expect("valid filetime");
        let now = chrono::Utc::now();
        assert!((now - dt).num_seconds().abs() < 60);
    }
}
