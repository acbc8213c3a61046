//! Registry cell type definitions, length-prefix parsing, and allocation
//! size classes.
//!
//! Cells are the fundamental allocation unit within a hive (spec §3). Each
//! cell is a 4-byte signed length prefix (negative = allocated, positive =
//! free) followed by payload; most payloads begin with a 2-byte signature
//! identifying the entity stored there.

use crate::error::{RegistryError, Result};
use crate::utils::{read_i32_le, write_i32_le};

/// Cell type signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Key node (nk) - represents a registry key.
    KeyNode,

    /// Value key (vk) - represents a registry value.
    ValueKey,

    /// Security descriptor (sk).
    Security,

    /// Index leaf (li) - list of subkey offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list of subkeys with name hints.
    FastLeaf,

    /// Hash leaf (lh) - list of subkeys with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,

    /// Data block (db) - big data block.
    DataBlock,

    /// Raw, unsigned data cell (value data > 4 bytes, or a value list).
    Raw,
}

impl CellType {
    /// Parses a cell type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"nk" => Ok(CellType::KeyNode),
            b"vk" => Ok(CellType::ValueKey),
            b"sk" => Ok(CellType::Security),
            b"li" => Ok(CellType::IndexLeaf),
            b"lf" => Ok(CellType::FastLeaf),
            b"lh" => Ok(CellType::HashLeaf),
            b"ri" => Ok(CellType::IndexRoot),
            b"db" => Ok(CellType::DataBlock),
            _ => Err(RegistryError::unknown_cell_type(*sig, 0)),
        }
    }

    /// Returns the 2-byte signature for this cell type, or `None` for
    /// unsigned raw cells.
    pub fn signature(&self) -> Option<&'static [u8; 2]> {
        match self {
            CellType::KeyNode => Some(b"nk"),
            CellType::ValueKey => Some(b"vk"),
            CellType::Security => Some(b"sk"),
            CellType::IndexLeaf => Some(b"li"),
            CellType::FastLeaf => Some(b"lf"),
            CellType::HashLeaf => Some(b"lh"),
            CellType::IndexRoot => Some(b"ri"),
            CellType::DataBlock => Some(b"db"),
            CellType::Raw => None,
        }
    }

    /// Returns true if this cell type represents a subkey list.
    pub fn is_subkey_list(&self) -> bool {
        matches!(
            self,
            CellType::IndexLeaf | CellType::FastLeaf | CellType::HashLeaf | CellType::IndexRoot
        )
    }
}

/// Size-class hint used by the allocator's segregated free lists
/// (spec §4.1). Distinct from `CellType` in that it groups similarly-sized,
/// similarly-lived cells rather than distinguishing every signature: `lf`
/// and `lh` share a class because they have identical entry layout, and
/// value-list / data cells share `Raw` because neither carries a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellClass {
    /// Key node cells.
    Nk,
    /// Value key cells.
    Vk,
    /// `lf`/`lh` hash-hinted subkey lists.
    Lf,
    /// `li` plain-offset subkey lists.
    Li,
    /// `ri` index-of-indices lists.
    Ri,
    /// Value lists and value data cells.
    Raw,
}

impl CellClass {
    /// All classes, in a stable order used to enumerate free lists.
    pub const ALL: [CellClass; 6] = [
        CellClass::Nk,
        CellClass::Vk,
        CellClass::Lf,
        CellClass::Li,
        CellClass::Ri,
        CellClass::Raw,
    ];
}

/// Flags for key nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNodeFlags(pub u16);

impl KeyNodeFlags {
    /// Key is volatile (not stored on disk).
    pub const VOLATILE: u16 = 0x0001;

    /// Key is a mount point for another hive.
    pub const HIVE_EXIT: u16 = 0x0002;

    /// Key is the root key.
    pub const ROOT_KEY: u16 = 0x0004;

    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;

    /// Key is a symbolic link.
    pub const SYM_LINK: u16 = 0x0010;

    /// Key name is in compressed format (ASCII).
    pub const COMP_NAME: u16 = 0x0020;

    /// Key is a predefined handle.
    pub const PREDEF_HANDLE: u16 = 0x0040;

    /// Creates a new `KeyNodeFlags` from a u16 value.
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Returns true if the specified flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Returns true if the key name is compressed (ASCII).
    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMP_NAME)
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.has_flag(Self::ROOT_KEY)
    }
}

/// Registry value data types (spec §6.2's documented type codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// No value type.
    None,
    /// String (null-terminated).
    String,
    /// String with environment variables.
    ExpandString,
    /// Binary data.
    Binary,
    /// 32-bit little-endian integer.
    Dword,
    /// 32-bit big-endian integer.
    DwordBigEndian,
    /// Symbolic link (Unicode).
    Link,
    /// Multiple strings.
    MultiString,
    /// Resource list.
    ResourceList,
    /// Full resource descriptor.
    FullResourceDescriptor,
    /// Resource requirements list.
    ResourceRequirementsList,
    /// 64-bit little-endian integer.
    Qword,
    /// Unknown or non-standard value type; carries the raw code.
    Unknown(u32),
}

impl ValueType {
    /// Parses a value type from its documented u32 code.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            other => ValueType::Unknown(other),
        }
    }

    /// Returns the documented u32 code for this value type.
    pub fn to_u32(&self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(code) => *code,
        }
    }

    /// Returns the canonical registry type name (e.g. `REG_SZ`).
    pub fn name(&self) -> String {
        match self {
            ValueType::None => "REG_NONE".to_string(),
            ValueType::String => "REG_SZ".to_string(),
            ValueType::ExpandString => "REG_EXPAND_SZ".to_string(),
            ValueType::Binary => "REG_BINARY".to_string(),
            ValueType::Dword => "REG_DWORD".to_string(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".to_string(),
            ValueType::Link => "REG_LINK".to_string(),
            ValueType::MultiString => "REG_MULTI_SZ".to_string(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".to_string(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".to_string(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".to_string(),
            ValueType::Qword => "REG_QWORD".to_string(),
            ValueType::Unknown(value) => format!("REG_UNKNOWN_{:#010x}", value),
        }
    }

    /// Parses a canonical registry type name back into a `ValueType`, the
    /// inverse of [`ValueType::name`]. Used by the JSON plan format (§6.3).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "REG_NONE" => ValueType::None,
            "REG_SZ" => ValueType::String,
            "REG_EXPAND_SZ" => ValueType::ExpandString,
            "REG_BINARY" => ValueType::Binary,
            "REG_DWORD" => ValueType::Dword,
            "REG_DWORD_BIG_ENDIAN" => ValueType::DwordBigEndian,
            "REG_LINK" => ValueType::Link,
            "REG_MULTI_SZ" => ValueType::MultiString,
            "REG_RESOURCE_LIST" => ValueType::ResourceList,
            "REG_FULL_RESOURCE_DESCRIPTOR" => ValueType::FullResourceDescriptor,
            "REG_RESOURCE_REQUIREMENTS_LIST" => ValueType::ResourceRequirementsList,
            "REG_QWORD" => ValueType::Qword,
            _ => return None,
        })
    }
}

/// Reads the 4-byte length prefix of a cell at `abs_offset` within `data`.
///
/// Returns `(abs_size, is_allocated)` where `abs_size` includes the prefix
/// itself. Does not validate alignment; callers that need P1 enforcement
/// should call [`validate_cell_size`] separately.
pub fn read_cell_header(data: &[u8], abs_offset: usize) -> Result<(u32, bool)> {
    let raw = read_i32_le(data, abs_offset)?;
    if raw == 0 {
        return Err(RegistryError::invalid_cell_size(raw, abs_offset as u32));
    }
    Ok((raw.unsigned_abs(), raw < 0))
}

/// Writes a cell length prefix: negative when `allocated` is true.
pub fn write_cell_header(data: &mut [u8], abs_offset: usize, size: u32, allocated: bool) -> Result<()> {
    let signed = size as i32;
    write_i32_le(data, abs_offset, if allocated { -signed } else { signed })
}

/// Validates a cell's total size against spec invariant P1: at least
/// `MIN_CELL_SIZE`, a multiple of `CELL_ALIGNMENT`.
pub fn validate_cell_size(size: u32, offset: u32) -> Result<()> {
    use crate::utils::{CELL_ALIGNMENT, MIN_CELL_SIZE};
    if size < MIN_CELL_SIZE || size % CELL_ALIGNMENT != 0 {
        return Err(RegistryError::invalid_cell_size(size as i32, offset));
    }
    Ok(())
}
