//! Registry value (vk) parsing, construction, and data encoding.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::utils::{
    read_ascii_string, read_i32_le, read_u16_le, read_u32_le, read_utf16_string,
    write_ascii_string, write_u16_le, write_u32_le, write_utf16_string,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Minimum size of a value key structure (fixed fields only).
pub const VALUE_KEY_MIN_SIZE: usize = 20;

/// Bit set on the encoded data length when data is stored inline.
const INLINE_FLAG: i32 = i32::MIN;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name in bytes as stored on disk.
    pub name_length: u16,

    /// Length of value data in bytes.
    pub data_length: u32,

    /// Offset to value data, or the inline bytes themselves when
    /// `data_length <= 4`.
    pub data_offset: u32,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is ASCII).
    pub flags: u16,

    /// Value name. The unnamed (default) value is represented as `""`
    /// internally and rendered as `(default)` only at display time.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_KEY_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"vk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'vk' signature at offset {:#x}",
                offset
            )));
        }

        let name_length = read_u16_le(data, 0x02)?;

        let data_length_raw = read_i32_le(data, 0x04)?;
        let data_length = (data_length_raw & 0x7FFF_FFFF) as u32;

        let data_offset = read_u32_le(data, 0x08)?;
        let data_type_raw = read_u32_le(data, 0x0C)?;
        let data_type = ValueType::from_u32(data_type_raw);
        let flags = read_u16_le(data, 0x10)?;

        let name = if name_length > 0 {
            let name_end = 0x14 + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[0x14..name_end];

            if (flags & 0x0001) != 0 {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::new()
        };

        Ok(ValueKey {
            name_length,
            data_length,
            data_offset,
            data_type,
            flags,
            name,
        })
    }

    /// Builds a value key for `name`/`data_type`, with `data_length` and
    /// `data_offset` filled in by [`ValueKey::place_data`] once the caller
    /// knows whether the payload fits inline.
    pub fn new(name: &str, data_type: ValueType) -> Self {
        let (name_bytes, ascii) = encode_value_name(name);
        ValueKey {
            name_length: name_bytes.len() as u16,
            data_length: 0,
            data_offset: 0,
            data_type,
            flags: if ascii { 0x0001 } else { 0x0000 },
            name: name.to_string(),
        }
    }

    /// Sets `data_length`/`data_offset` for `payload`: inline (packed into
    /// `data_offset` itself) when `payload.len() <= 4`, otherwise a
    /// reference to a separately-allocated data cell at `cell_offset`.
    pub fn place_data(&mut self, payload: &[u8], cell_offset: Option<u32>) {
        self.data_length = payload.len() as u32;
        if payload.len() <= 4 {
            let mut bytes = [0u8; 4];
            bytes[..payload.len()].copy_from_slice(payload);
            self.data_offset = u32::from_le_bytes(bytes);
        } else {
            self.data_offset = cell_offset.unwrap_or(crate::utils::INVALID_OFFSET);
        }
    }

    /// Number of bytes this value key occupies as a cell payload.
    pub fn encoded_len(&self) -> u32 {
        let (name_bytes, _) = encode_value_name(&self.name);
        VALUE_KEY_MIN_SIZE as u32 + name_bytes.len() as u32
    }

    /// Serializes this value key into `buf`, which must be at least
    /// [`ValueKey::encoded_len`] bytes.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let (name_bytes, _) = encode_value_name(&self.name);
        let required = VALUE_KEY_MIN_SIZE + name_bytes.len();
        if buf.len() < required {
            return Err(RegistryError::TruncatedData {
                offset: 0,
                expected: required,
                actual: buf.len(),
            });
        }

        buf[0..2].copy_from_slice(b"vk");
        write_u16_le(buf, 0x02, name_bytes.len() as u16)?;

        let encoded_length = if self.is_inline_data() {
            (self.data_length as i32) | INLINE_FLAG
        } else {
            self.data_length as i32
        };
        crate::utils::write_i32_le(buf, 0x04, encoded_length)?;

        write_u32_le(buf, 0x08, self.data_offset)?;
        write_u32_le(buf, 0x0C, self.data_type.to_u32())?;
        write_u16_le(buf, 0x10, self.flags)?;
        write_u16_le(buf, 0x12, 0)?; // spare
        buf[0x14..0x14 + name_bytes.len()].copy_from_slice(&name_bytes);
        Ok(())
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.data_length <= 4 && self.data_length > 0
    }

    /// Extracts inline data (when data_length <= 4).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        bytes[..self.data_length as usize].to_vec()
    }

    /// True if this is the unnamed (default) value.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Display name: `(default)` for the unnamed value, else the name
    /// verbatim.
    pub fn display_name(&self) -> &str {
        if self.is_default() {
            "(default)"
        } else {
            &self.name
        }
    }
}

fn encode_value_name(name: &str) -> (Vec<u8>, bool) {
    if name.is_ascii() {
        (write_ascii_string(name), true)
    } else {
        (write_utf16_string(name), false)
    }
}

/// Parsed registry value data.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    /// No data.
    None,
    /// String value.
    String(String),
    /// Expandable string value.
    ExpandString(String),
    /// Binary data.
    Binary(Vec<u8>),
    /// 32-bit integer.
    Dword(u32),
    /// 32-bit big-endian integer.
    DwordBigEndian(u32),
    /// Multiple strings.
    MultiString(Vec<String>),
    /// 64-bit integer.
    Qword(u64),
    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Dword(cursor.read_u32::<LittleEndian>()?))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::DwordBigEndian(cursor.read_u32::<BigEndian>()?))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 8,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Qword(cursor.read_u64::<LittleEndian>()?))
            }

            ValueType::MultiString => {
                let full_string = read_utf16_string(data, offset)?;
                let strings: Vec<String> = full_string
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Encodes this value back into its on-disk byte representation plus
    /// the `ValueType` to store alongside it.
    pub fn encode(&self) -> (Vec<u8>, ValueType) {
        match self {
            ValueData::None => (Vec::new(), ValueType::None),
            ValueData::String(s) => (write_utf16_string_with_nul(s), ValueType::String),
            ValueData::ExpandString(s) => (write_utf16_string_with_nul(s), ValueType::ExpandString),
            ValueData::Binary(b) => (b.clone(), ValueType::Binary),
            ValueData::Dword(d) => (d.to_le_bytes().to_vec(), ValueType::Dword),
            ValueData::DwordBigEndian(d) => (d.to_be_bytes().to_vec(), ValueType::DwordBigEndian),
            ValueData::Qword(q) => (q.to_le_bytes().to_vec(), ValueType::Qword),
            ValueData::MultiString(strings) => {
                let mut out = Vec::new();
                for s in strings {
                    out.extend_from_slice(&write_utf16_string_with_nul(s));
                }
                out.extend_from_slice(&[0, 0]);
                (out, ValueType::MultiString)
            }
            ValueData::Unknown(b) => (b.clone(), ValueType::Unknown(0)),
        }
    }

    /// Converts the value data to a human-readable string representation.
    pub fn display(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) => s.clone(),
            ValueData::Binary(b) => format!("{:02X?}", b),
            ValueData::Dword(d) => format!("{} (0x{:08X})", d, d),
            ValueData::DwordBigEndian(d) => format!("{} (0x{:08X})", d, d),
            ValueData::Qword(q) => format!("{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => strings.join(", "),
            ValueData::Unknown(b) => format!("{:02X?}", b),
        }
    }
}

fn write_utf16_string_with_nul(s: &str) -> Vec<u8> {
    let mut out = write_utf16_string(s);
    out.extend_from_slice(&[0, 0]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_data_roundtrip() {
        let mut vk = ValueKey::new("Count", ValueType::Dword);
        vk.place_data(&[0x01, 0x02, 0x03, 0x04], None);

        let mut buf = vec![0u8; vk.encoded_len() as usize];
        vk.write(&mut buf).unwrap();

        let parsed = ValueKey::parse(&buf, 0).unwrap();
        assert!(parsed.is_inline_data());
        assert_eq!(parsed.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(parsed.name, "Count");
    }

    #[test]
    fn test_out_of_line_data_stores_offset() {
        let mut vk = ValueKey::new("Description", ValueType::String);
        let (payload, _) = ValueData::String("hello world".into()).encode();
        vk.place_data(&payload, Some(0x500));

        let mut buf = vec![0u8; vk.encoded_len() as usize];
        vk.write(&mut buf).unwrap();

        let parsed = ValueKey::parse(&buf, 0).unwrap();
        assert!(!parsed.is_inline_data());
        assert_eq!(parsed.data_offset, 0x500);
        assert_eq!(parsed.data_length, payload.len() as u32);
    }

    #[test]
    fn test_default_value_name_is_empty_but_displays() {
        let vk = ValueKey::new("", ValueType::String);
        assert!(vk.is_default());
        assert_eq!(vk.display_name(), "(default)");
    }

    #[test]
    fn test_value_data_encode_decode_roundtrip() {
        let original = ValueData::MultiString(vec!["a".into(), "b".into()]);
        let (bytes, vtype) = original.encode();
        let decoded = ValueData::parse(&bytes, vtype, 0).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_dword_encode_decode_roundtrip() {
        let original = ValueData::Dword(42);
        let (bytes, vtype) = original.encode();
        let decoded = ValueData::parse(&bytes, vtype, 0).unwrap();
        assert_eq!(decoded, original);
    }
}
