//! Hive bin (hbin) block parsing.
//!
//! Hive bins are 4KB-aligned blocks that contain registry cells. Each hbin
//! has a header followed by a sequence of cells.

use crate::error::{RegistryError, Result};
use crate::header;
use crate::utils::{read_u32_le, write_u32_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Minimum size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bin header structure.
///
/// Each hbin contains a header followed by registry cells. Hbins are always
/// aligned to 4KB boundaries.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Signature, should be "hbin" (0x6E696268).
    pub signature: [u8; 4],
    
    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,
    
    /// Size of this hbin in bytes (including header).
    pub size: u32,
    
    /// Reserved fields.
    pub reserved: [u32; 2],
    
    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,
    
    /// Spare field.
    pub spare: u32,
}

impl HbinHeader {
    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected offset value for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset doesn't match expected value
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        // Read signature
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &signature));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;
        
        // Validate offset
        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        let reserved = [
            read_u32_le(data, 0x0C)?,
            read_u32_le(data, 0x10)?,
        ];
        
        let timestamp = u64::from(read_u32_le(data, 0x14)?)
            | (u64::from(read_u32_le(data, 0x18)?) << 32);
        
        let spare = read_u32_le(data, 0x1C)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            reserved,
            timestamp,
            spare,
        })
    }

    /// Returns the size of the data area (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }

    /// Writes a fresh hbin header of `size` bytes at relative `offset` into
    /// `data[0..HBIN_HEADER_SIZE]`. `size` must already be a multiple of
    /// [`crate::utils::HBIN_ALIGNMENT`]; the allocator enforces that.
    pub fn format_new(data: &mut [u8], offset: u32, size: u32) -> Result<()> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        data[..HBIN_HEADER_SIZE].fill(0);
        data[0..4].copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(data, 0x04, offset)?;
        write_u32_le(data, 0x08, size)?;
        header::write_filetime_now(data, 0x14)?;
        Ok(())
    }

    /// Updates the size field of an already-formatted hbin header in place,
    /// used when the allocator grows the last hbin rather than appending a
    /// new one.
    pub fn set_size(data: &mut [u8], new_size: u32) -> Result<()> {
        write_u32_le(data, 0x08, new_size)
    }
}
