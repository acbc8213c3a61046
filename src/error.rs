//! Error types for hive merge operations.
//!
//! This module provides the error taxonomy described in spec §7: malformed
//! input, I/O, corrupted hive, out of space, transaction state, and
//! cancellation, plus the read-path errors inherited from cell/header
//! parsing.

use std::io;
use thiserror::Error;

/// Result type alias for hive merge operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while parsing or mutating a registry hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error occurred while reading or writing the hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature { expected: Vec<u8>, found: Vec<u8> },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is out of bounds.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset { offset: u32, hive_size: usize },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize { size: i32, offset: u32 },

    /// Unknown or unsupported cell type.
    #[error("Unknown cell type: {cell_type:?} at offset {offset:#x}")]
    UnknownCellType { cell_type: [u8; 2], offset: u32 },

    /// Key or value not found during a resolve (as opposed to a delete,
    /// which tolerates absence).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 { offset: u32 },

    /// Invalid registry value type code.
    #[error("Invalid value type: {0}")]
    InvalidValueType(u32),

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall { size: usize, minimum: usize },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch { expected: u32, calculated: u32 },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList { list_type: [u8; 2] },

    /// Counts on a key node disagree with its list contents (P3 violation).
    #[error("Inconsistent counts at key offset {key_offset:#x}: recorded {recorded}, found {found}")]
    InconsistentCounts {
        key_offset: u32,
        recorded: u32,
        found: u32,
    },

    /// A plan op referenced an empty key path.
    #[error("empty key path in op {op_index}")]
    EmptyKeyPath { op_index: usize },

    /// A plan op named an operation this engine does not recognize.
    #[error("unknown op kind {0:?}")]
    InvalidOp(String),

    /// A JSON patch document did not match the documented schema.
    #[error("invalid plan JSON: {0}")]
    InvalidPlanJson(String),

    /// The allocator could not satisfy a request.
    #[error("out of space: requested {requested} bytes ({reason})")]
    OutOfSpace { requested: u32, reason: String },

    /// Session configuration is out of the documented valid range.
    #[error("invalid session option: {0}")]
    InvalidOption(String),

    /// `commit` was called without a matching `begin`, or `begin` was
    /// called twice without an intervening commit/rollback.
    #[error("invalid transaction state: {0}")]
    TransactionState(String),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An op within a plan failed; partial progress is reported alongside.
    #[error("op {op_index} ({op_kind}) at {path:?} failed: {source}")]
    Apply {
        op_index: usize,
        op_kind: &'static str,
        path: Vec<String>,
        #[source]
        source: Box<RegistryError>,
    },
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a not found error with context about what was being searched.
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unknown cell type error.
    pub fn unknown_cell_type(cell_type: [u8; 2], offset: u32) -> Self {
        Self::UnknownCellType { cell_type, offset }
    }

    /// Wraps a failure observed while applying a specific op in a plan.
    pub fn apply_failed(
        op_index: usize,
        op_kind: &'static str,
        path: &[String],
        source: RegistryError,
    ) -> Self {
        Self::Apply {
            op_index,
            op_kind,
            path: path.to_vec(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_formats_item_and_name() {
        let err = RegistryError::not_found("value", "DisplayName");
        assert_eq!(err.to_string(), "Not found: value 'DisplayName'");
    }

    #[test]
    fn test_apply_error_chains_cause() {
        let cause = RegistryError::EmptyKeyPath { op_index: 0 };
        let err = RegistryError::apply_failed(3, "set_value", &["A".into(), "B".into()], cause);
        let msg = err.to_string();
        assert!(msg.contains("op 3"));
        assert!(msg.contains("set_value"));
    }
}
