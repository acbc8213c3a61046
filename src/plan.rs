//! Mutation plans: the ordered list of operations a session applies, and
//! their JSON wire format (spec §6).
//!
//! A plan is data, not behavior — [`crate::strategy`] and [`crate::session`]
//! are what turn it into byte-level edits. Keeping `Op` serde-derived (the
//! way the corpus reaches for `serde_json` for any structured interchange
//! format) gives round-tripping for free and keeps property P8 (JSON
//! round-trip) trivially true by construction.
//!
//! The wire shape mirrors the on-disk shape exactly: `key_path` is an array
//! of name segments (never a backslash-joined string, which would need
//! escaping for names that contain a backslash), and `data` is the raw
//! value bytes as they're written to the cell, not a type-native JSON value.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::value::ValueData;
use serde::{Deserialize, Serialize};

/// A single mutation against the hive tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Creates `key_path` and any missing ancestors; a no-op if it exists.
    EnsureKey {
        /// Root-first name segments.
        key_path: Vec<String>,
    },
    /// Creates or overwrites a value under `key_path`, creating the key
    /// first if needed.
    SetValue {
        /// Root-first name segments.
        key_path: Vec<String>,
        /// Value name; `""` means the key's unnamed (default) value.
        value_name: String,
        /// Canonical type name, e.g. `REG_SZ`, `REG_DWORD`.
        value_type: String,
        /// Raw data bytes, exactly as written to the value's cell.
        data: Vec<u8>,
    },
    /// Removes a single value; a no-op if it doesn't exist.
    DeleteValue {
        /// Root-first name segments.
        key_path: Vec<String>,
        /// Value name; `""` means the unnamed (default) value.
        value_name: String,
    },
    /// Removes `key_path` and everything under it; a no-op if it doesn't
    /// exist.
    DeleteKey {
        /// Root-first name segments.
        key_path: Vec<String>,
    },
}

impl Op {
    /// The path this op operates against.
    pub fn key_path(&self) -> &[String] {
        match self {
            Op::EnsureKey { key_path }
            | Op::SetValue { key_path, .. }
            | Op::DeleteValue { key_path, .. }
            | Op::DeleteKey { key_path } => key_path,
        }
    }

    /// A short, stable label for error messages and tracing spans.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::EnsureKey { .. } => "ensure_key",
            Op::SetValue { .. } => "set_value",
            Op::DeleteValue { .. } => "delete_value",
            Op::DeleteKey { .. } => "delete_key",
        }
    }

    /// Rejects ops the engine must refuse outright rather than apply: an
    /// empty path, or a path containing an empty segment.
    pub fn validate(&self) -> Result<()> {
        let path = self.key_path();
        if path.is_empty() || path.iter().any(|s| s.is_empty()) {
            return Err(RegistryError::InvalidPlanJson(
                "key_path must be a non-empty array of non-empty name segments".into(),
            ));
        }
        Ok(())
    }
}

/// An ordered sequence of ops, applied in order within one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The ops, in application order.
    #[serde(rename = "operations")]
    pub ops: Vec<Op>,
}

impl Plan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Plan::default()
    }

    /// Parses a plan from its documented `{"operations": [...]}` form.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let plan: Plan =
            serde_json::from_str(s).map_err(|e| RegistryError::InvalidPlanJson(e.to_string()))?;
        for op in &plan.ops {
            op.validate()?;
        }
        Ok(plan)
    }

    /// Serializes the plan back to its documented `{"operations": [...]}`
    /// form.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RegistryError::InvalidPlanJson(e.to_string()))
    }

    /// Splits a backslash-separated path into its non-empty segments. A
    /// convenience for building [`Op::key_path`] values in code; the wire
    /// format itself never uses backslash-joined paths.
    pub fn split_path(key_path: &str) -> Vec<String> {
        key_path
            .split('\\')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Decodes a plan op's `value_type`/`data` pair into on-disk value bytes.
pub fn decode_value_data(value_type: &str, data: &[u8]) -> Result<ValueData> {
    let vt = ValueType::from_name(value_type)
        .ok_or_else(|| RegistryError::InvalidPlanJson(format!("unknown value type {:?}", value_type)))?;
    ValueData::parse(data, vt, 0)
}

/// Encodes on-disk value data into its plan JSON `data` representation.
pub fn encode_value_data(value: &ValueData) -> Vec<u8> {
    value.encode().0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_json_roundtrip() {
        let plan = Plan {
            ops: vec![
                Op::EnsureKey { key_path: vec!["Software".into(), "Vendor".into()] },
                Op::SetValue {
                    key_path: vec!["Software".into(), "Vendor".into()],
                    value_name: "Enabled".into(),
                    value_type: "REG_DWORD".into(),
                    data: vec![1, 0, 0, 0],
                },
                Op::DeleteValue {
                    key_path: vec!["Software".into(), "Vendor".into()],
                    value_name: "Old".into(),
                },
                Op::DeleteKey { key_path: vec!["Software".into(), "Legacy".into()] },
            ],
        };

        let json = plan.to_json_string().unwrap();
        let parsed = Plan::from_json_str(&json).unwrap();
        assert_eq!(plan, parsed);
    }

    #[test]
    fn test_wire_format_matches_documented_shape() {
        let json = r#"{"operations": [
            {"op": "set_value", "key_path": ["Software", "Vendor"],
             "value_name": "Installed", "value_type": "REG_DWORD", "data": [1, 0, 0, 0]}
        ]}"#;
        let plan = Plan::from_json_str(json).unwrap();
        assert_eq!(
            plan.ops[0],
            Op::SetValue {
                key_path: vec!["Software".into(), "Vendor".into()],
                value_name: "Installed".into(),
                value_type: "REG_DWORD".into(),
                data: vec![1, 0, 0, 0],
            }
        );
    }

    #[test]
    fn test_bare_array_is_rejected() {
        let err = Plan::from_json_str(r#"[{"op": "ensure_key", "key_path": ["A"]}]"#).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPlanJson(_)));
    }

    #[test]
    fn test_backslash_key_path_is_rejected() {
        let err = Plan::from_json_str(
            r#"{"operations": [{"op": "ensure_key", "key_path": "Software\\Vendor"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPlanJson(_)));
    }

    #[test]
    fn test_empty_key_path_is_rejected() {
        let err = Plan::from_json_str(r#"{"operations": [{"op": "ensure_key", "key_path": []}]}"#)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPlanJson(_)));
    }

    #[test]
    fn test_split_path_ignores_empty_segments() {
        let segments = Plan::split_path("\\Software\\Vendor\\");
        assert_eq!(segments, vec!["Software".to_string(), "Vendor".to_string()]);
    }

    #[test]
    fn test_decode_dword() {
        let vd = decode_value_data("REG_DWORD", &[42, 0, 0, 0]).unwrap();
        assert_eq!(vd, ValueData::Dword(42));
    }

    #[test]
    fn test_decode_multi_string() {
        let (bytes, _) = ValueData::MultiString(vec!["a".into(), "b".into()]).encode();
        let vd = decode_value_data("REG_MULTI_SZ", &bytes).unwrap();
        assert_eq!(vd, ValueData::MultiString(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_encode_decode_binary_roundtrip() {
        let vd = ValueData::Binary(vec![1, 2, 3]);
        let bytes = encode_value_data(&vd);
        let decoded = decode_value_data("REG_BINARY", &bytes).unwrap();
        assert_eq!(decoded, vd);
    }

    #[test]
    fn test_unknown_value_type_rejected() {
        let err = decode_value_data("REG_NOT_A_TYPE", &[]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPlanJson(_)));
    }
}
