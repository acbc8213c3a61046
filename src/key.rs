//! Registry key node (nk) parsing, construction, and serialization.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::header;
use crate::utils::{
    read_ascii_string, read_u16_le, read_u32_le, read_utf16_string, write_ascii_string,
    write_u16_le, write_u32_le, write_utf16_string, INVALID_OFFSET,
};

/// Minimum size of a key node structure in bytes (fixed fields only).
pub const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Access bits (unused).
    pub access_bits: u32,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys (always 0; volatile keys are never
    /// persisted by this engine).
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list (always `INVALID_OFFSET` here).
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name.
    pub max_subkey_name_len: u32,

    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,

    /// Maximum length of value name.
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Work variable (unused).
    pub work_var: u32,

    /// Length of key name in bytes as stored on disk.
    pub name_length: u16,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// `data` is the cell payload (excluding the size field), starting with
    /// the `nk` signature; `offset` is used for error reporting only.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'nk' signature at offset {:#x}",
                offset
            )));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);

        let last_written = u64::from(read_u32_le(data, 0x04)?)
            | (u64::from(read_u32_le(data, 0x08)?) << 32);

        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, 0x10)?;
        let subkey_count = read_u32_le(data, 0x14)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, 0x1C)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, 0x24)?;
        let value_list_offset = read_u32_le(data, 0x28)?;
        let security_offset = read_u32_le(data, 0x2C)?;
        let class_name_offset = read_u32_le(data, 0x30)?;

        let max_subkey_name_len = read_u32_le(data, 0x34)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, 0x3C)?;
        let max_value_data_len = read_u32_le(data, 0x40)?;
        let work_var = read_u32_le(data, 0x44)?;

        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        let name = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[KEY_NAME_OFFSET..name_end];

            if flags.is_compressed() {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Builds a freshly-allocated key node ready to be written to a cell.
    /// Subkey/value offsets are `INVALID_OFFSET` until `ensure_key`/
    /// `set_value` fill them in.
    pub fn new(name: &str, parent_offset: u32, is_root: bool) -> Self {
        let (_, compressed) = encode_name(name);
        let mut flags = if compressed { KeyNodeFlags::COMP_NAME } else { 0 };
        if is_root {
            flags |= KeyNodeFlags::ROOT_KEY;
        }

        KeyNode {
            flags: KeyNodeFlags::new(flags),
            last_written: 0,
            access_bits: 0,
            parent_offset,
            subkey_count: 0,
            volatile_subkey_count: 0,
            subkey_list_offset: INVALID_OFFSET,
            volatile_subkey_list_offset: INVALID_OFFSET,
            value_count: 0,
            value_list_offset: INVALID_OFFSET,
            security_offset: INVALID_OFFSET,
            class_name_offset: INVALID_OFFSET,
            max_subkey_name_len: 0,
            max_subkey_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            work_var: 0,
            name_length: encode_name(name).0.len() as u16,
            class_name_length: 0,
            name: name.to_string(),
        }
    }

    /// Number of bytes this key node occupies as a cell payload.
    pub fn encoded_len(&self) -> u32 {
        let (name_bytes, _) = encode_name(&self.name);
        KEY_NODE_MIN_SIZE as u32 + name_bytes.len() as u32
    }

    /// Serializes this key node into `buf`, which must be at least
    /// [`KeyNode::encoded_len`] bytes.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let (name_bytes, compressed) = encode_name(&self.name);
        let required = KEY_NODE_MIN_SIZE + name_bytes.len();
        if buf.len() < required {
            return Err(RegistryError::TruncatedData {
                offset: 0,
                expected: required,
                actual: buf.len(),
            });
        }

        buf[0..2].copy_from_slice(b"nk");
        let mut flags = self.flags.0;
        flags = if compressed {
            flags | KeyNodeFlags::COMP_NAME
        } else {
            flags & !KeyNodeFlags::COMP_NAME
        };
        write_u16_le(buf, 0x02, flags)?;
        write_u32_le(buf, 0x04, (self.last_written & 0xFFFF_FFFF) as u32)?;
        write_u32_le(buf, 0x08, (self.last_written >> 32) as u32)?;
        write_u32_le(buf, 0x0C, self.access_bits)?;
        write_u32_le(buf, 0x10, self.parent_offset)?;
        write_u32_le(buf, 0x14, self.subkey_count)?;
        write_u32_le(buf, 0x18, self.volatile_subkey_count)?;
        write_u32_le(buf, 0x1C, self.subkey_list_offset)?;
        write_u32_le(buf, 0x20, self.volatile_subkey_list_offset)?;
        write_u32_le(buf, 0x24, self.value_count)?;
        write_u32_le(buf, 0x28, self.value_list_offset)?;
        write_u32_le(buf, 0x2C, self.security_offset)?;
        write_u32_le(buf, 0x30, self.class_name_offset)?;
        write_u32_le(buf, 0x34, self.max_subkey_name_len)?;
        write_u32_le(buf, 0x38, self.max_subkey_class_len)?;
        write_u32_le(buf, 0x3C, self.max_value_name_len)?;
        write_u32_le(buf, 0x40, self.max_value_data_len)?;
        write_u32_le(buf, 0x44, self.work_var)?;
        write_u16_le(buf, 0x48, name_bytes.len() as u16)?;
        write_u16_le(buf, 0x4A, self.class_name_length)?;
        buf[KEY_NAME_OFFSET..KEY_NAME_OFFSET + name_bytes.len()].copy_from_slice(&name_bytes);
        Ok(())
    }

    /// Writes the current time into this key's `last_written` field at its
    /// fixed cell offset (0x04), without touching the rest of the cell.
    pub fn touch(buf: &mut [u8]) -> Result<()> {
        header::write_filetime_now(buf, 0x04)
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}

/// Encodes a key/value name the way it will be stored: ASCII-compressed
/// when every character is ASCII, UTF-16LE otherwise. Returns the encoded
/// bytes and whether compression was used.
fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name.is_ascii() {
        (write_ascii_string(name), true)
    } else {
        (write_utf16_string(name), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_new_key_write_parse_roundtrip() {
        let key = KeyNode::new("Microsoft", 0x20, false);
        let mut buf = vec![0u8; key.encoded_len() as usize];
        key.write(&mut buf).unwrap();

        let parsed = KeyNode::parse(&buf, 0).unwrap();
        assert_eq!(parsed.name, "Microsoft");
        assert_eq!(parsed.parent_offset, 0x20);
        assert!(!parsed.is_root());
        assert_eq!(parsed.subkey_list_offset, INVALID_OFFSET);
    }

    #[test]
    fn test_root_key_flag_set() {
        let key = KeyNode::new("ROOT", 0, true);
        let mut buf = vec![0u8; key.encoded_len() as usize];
        key.write(&mut buf).unwrap();
        let parsed = KeyNode::parse(&buf, 0).unwrap();
        assert!(parsed.is_root());
    }

    #[test]
    fn test_non_ascii_name_uses_utf16() {
        let key = KeyNode::new("caf\u{e9}", 0, false);
        let mut buf = vec![0u8; key.encoded_len() as usize];
        key.write(&mut buf).unwrap();
        let parsed = KeyNode::parse(&buf, 0).unwrap();
        assert_eq!(parsed.name, "caf\u{e9}");
        assert!(!parsed.flags.is_compressed());
    }
}
