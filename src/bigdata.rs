//! Big data block (db) parsing.
//!
//! Registry values larger than 16,344 bytes are stored in big data blocks,
//! which consist of a header cell followed by multiple data segments.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, write_u16_le, write_u32_le};

/// Values this size or smaller are stored directly; larger values are
/// split across `db` segments (spec §3).
pub const MAX_DIRECT_VALUE_SIZE: usize = 16_344;

/// Maximum payload bytes per big data segment.
pub const SEGMENT_SIZE: usize = 16_344;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of segments
/// 0x04    4     Offset to segment list
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,
    
    /// Offset to the list of segment offsets
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;
    
    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"db" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'db' signature at offset {:#x}, found {:?}",
                offset,
                &data[0..2]
            )));
        }

        let segment_count = read_u16_le(data, 0x02)?;
        
        // Segment list offset is stored at 0x04 (4 bytes)
        // Note: This is a cell offset, not an absolute offset
        let segment_list_offset = u32::from_le_bytes([
            data[0x04],
            data[0x05],
            data[0x06],
            data[0x07],
        ]);

        Ok(BigDataBlock {
            segment_count,
            segment_list_offset,
        })
    }

    /// Builds a big data block header referencing `segment_count` segments
    /// whose offsets are stored in a separate cell at `segment_list_offset`.
    pub fn new(segment_count: u16, segment_list_offset: u32) -> Self {
        BigDataBlock {
            segment_count,
            segment_list_offset,
        }
    }

    /// Number of bytes this header occupies as a cell payload.
    pub fn encoded_len() -> u32 {
        Self::MIN_SIZE as u32
    }

    /// Serializes this header into `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: 0,
                expected: Self::MIN_SIZE,
                actual: buf.len(),
            });
        }
        buf[0..2].copy_from_slice(b"db");
        write_u16_le(buf, 0x02, self.segment_count)?;
        write_u32_le(buf, 0x04, self.segment_list_offset)?;
        Ok(())
    }
}

/// Splits a large value's payload into chunks no larger than
/// [`SEGMENT_SIZE`], in the order they should be written.
pub fn split_into_segments(payload: &[u8]) -> Vec<&[u8]> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload.chunks(SEGMENT_SIZE).collect()
}

/// Encodes a segment offset list as a raw cell payload: a flat array of
/// little-endian cell offsets, one per segment.
pub fn encode_segment_list(offsets: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; offsets.len() * 4];
    for (i, &offset) in offsets.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigdata_minimum_size() {
        let data = vec![0u8; 7];
        let result = BigDataBlock::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_bigdata_invalid_signature() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"XX");
        let result = BigDataBlock::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_bigdata_valid() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"db");
        data[2] = 5; // segment_count low byte
        data[3] = 0; // segment_count high byte
        data[4..8].copy_from_slice(&[0x20, 0x00, 0x00, 0x00]); // segment_list_offset
        
        let db = BigDataBlock::parse(&data, 0).unwrap();
        assert_eq!(db.segment_count, 5);
        assert_eq!(db.segment_list_offset, 0x20);
    }

    #[test]
    fn test_write_parse_roundtrip() {
        let db = BigDataBlock::new(3, 0x2000);
        let mut buf = vec![0u8; BigDataBlock::encoded_len() as usize];
        db.write(&mut buf).unwrap();
        let parsed = BigDataBlock::parse(&buf, 0).unwrap();
        assert_eq!(parsed.segment_count, 3);
        assert_eq!(parsed.segment_list_offset, 0x2000);
    }

    #[test]
    fn test_split_into_segments() {
        let payload = vec![7u8; SEGMENT_SIZE + 100];
        let segments = split_into_segments(&payload);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), SEGMENT_SIZE);
        assert_eq!(segments[1].len(), 100);
    }

    #[test]
    fn test_encode_segment_list_roundtrip() {
        let offsets = vec![0x10, 0x20, 0x30];
        let encoded = encode_segment_list(&offsets);
        assert_eq!(encoded.len(), 12);
        assert_eq!(&encoded[0..4], &0x10u32.to_le_bytes());
        assert_eq!(&encoded[8..12], &0x30u32.to_le_bytes());
    }
}
