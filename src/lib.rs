//! # hive-merge
//!
//! A transactional merge engine for Windows registry hive files.
//!
//! A mutation [`Plan`] — an ordered list of `ensure_key`/`set_value`/
//! `delete_value`/`delete_key` ops, round-tripping through JSON — is applied
//! to a hive under one dual-sequence transaction. [`Session`] picks between
//! two apply engines depending on plan size: a full-index engine that walks
//! the tree once into a [`HiveIndex`] for O(1) lookups on every op, and a
//! single-pass engine that sorts ops by path and resolves each lookup with a
//! direct tree read, avoiding the up-front walk for small plans.
//!
//! ## Architecture
//!
//! 1. **Base Block (Header)**: hive metadata, root key offset, the
//!    primary/secondary sequence numbers that mark a transaction in flight.
//! 2. **Hive Bins (hbin)**: 4KB-aligned containers of cells, grown by the
//!    allocator as a plan needs more space.
//! 3. **Allocator**: a segregated-free-list allocator over the HBIN area,
//!    tracking dirty pages for the transaction manager's flush step.
//! 4. **Cells**: key nodes (nk), value keys (vk), subkey lists (lf/lh/li/ri),
//!    big data blocks (db) for values over 16344 bytes.
//! 5. **Write strategies**: in-place, append, or hybrid — how a resized
//!    cell's replacement is allocated and whether the old cell is freed.
//! 6. **Session**: wires the allocator, a write strategy, and a transaction
//!    together to apply one [`Plan`] at a time.
//!
//! ## Binary Layout
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Primary/secondary sequence numbers, timestamps, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Big data blocks (db)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hive_merge::{Hive, Plan, SessionOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = Plan::from_json_str(r#"{"operations": [
//!     {"op": "set_value", "key_path": ["Software", "Vendor"], "value_name": "Installed",
//!      "value_type": "REG_DWORD", "data": [1, 0, 0, 0]}
//! ]}"#)?;
//!
//! let mut hive = Hive::open("SOFTWARE")?;
//! let report = hive.apply(&plan, &SessionOptions::default())?;
//! println!("applied {} ops via {}", report.ops_applied, report.engine_used);
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! This crate edits hive files directly; it does not write or replay
//! transaction log files (.LOG1/.LOG2), nor does it parse security
//! descriptors or class names beyond passing their offsets through unedited.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bigdata;
pub mod cell;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod index;
pub mod key;
pub mod plan;
pub mod session;
pub mod strategy;
pub mod subkey_list;
pub mod transaction;
pub mod utils;
pub mod value;
pub mod view;

// Re-export main types for convenience
pub use allocator::{AllocOptions, Allocator, AllocatorStats, HbinStats};
pub use cell::{CellClass, CellType, KeyNodeFlags, ValueType};
pub use error::{RegistryError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::Hive;
pub use index::HiveIndex;
pub use key::KeyNode;
pub use plan::{Op, Plan};
pub use session::{ApplyReport, EngineMode, Session, SessionOptions};
pub use strategy::{Append, Hybrid, InPlace, Strategy};
pub use subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
pub use transaction::{FlushMode, TransactionManager};
pub use value::{ValueData, ValueKey};
pub use view::{HiveView, MappedView, MemView};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
