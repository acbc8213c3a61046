//! Top-level facade: opens a hive file (or an in-memory buffer) and applies
//! mutation plans to it under one session at a time.
//!
//! Mirrors the storage-enum shape the read-path parser this crate grew from
//! used for "memory-mapped vs. owned" data (`HiveData::Mapped`/`Owned`) — here
//! [`Backend`] picks between a growable mmap and a plain `Vec<u8>` so the same
//! [`Session`] code works whether the caller is editing a file on disk or
//! building a hive entirely in memory before writing it out once.

use crate::error::Result;
use crate::header::BaseBlock;
use crate::plan::Plan;
use crate::session::{ApplyReport, Session, SessionOptions};
use crate::view::{HiveView, MappedView, MemView};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{info, instrument};

/// Backing storage for an open hive.
enum Backend {
    /// A memory-mapped file, growable by truncate-and-remap.
    Mapped(MappedView),
    /// An in-memory buffer, used by tests and by callers assembling a hive
    /// before writing it out in one shot.
    Mem(MemView),
}

impl HiveView for Backend {
    fn len(&self) -> u32 {
        match self {
            Backend::Mapped(v) => v.len(),
            Backend::Mem(v) => v.len(),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Backend::Mapped(v) => v.as_bytes(),
            Backend::Mem(v) => v.as_bytes(),
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backend::Mapped(v) => v.as_bytes_mut(),
            Backend::Mem(v) => v.as_bytes_mut(),
        }
    }

    fn grow(&mut self, new_len: u32) -> Result<()> {
        match self {
            Backend::Mapped(v) => v.grow(new_len),
            Backend::Mem(v) => v.grow(new_len),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Backend::Mapped(v) => v.flush(),
            Backend::Mem(v) => v.flush(),
        }
    }
}

/// An open registry hive, ready to have mutation plans applied to it.
///
/// Each [`Hive::apply`]/[`Hive::apply_cancellable`] call opens a fresh
/// [`Session`] over the backing storage, runs one plan under one
/// transaction, and tears the session down — there is no persistent
/// in-process cache across calls.
pub struct Hive {
    backend: Backend,
}

impl Hive {
    /// Opens an existing hive file for read-write memory-mapped access.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("opening hive for read-write access");
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let view = MappedView::open(file)?;
        Ok(Hive { backend: Backend::Mapped(view) })
    }

    /// Creates a brand-new hive file of `initial_len` bytes (rounded up to a
    /// 4096-byte multiple by the caller) and maps it for read-write access.
    /// The caller is responsible for formatting the base block and root hbin
    /// before opening a [`Session`] over it.
    pub fn create<P: AsRef<Path>>(path: P, initial_len: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let view = MappedView::create(file, initial_len)?;
        Ok(Hive { backend: Backend::Mapped(view) })
    }

    /// Wraps an in-memory buffer as a hive, e.g. one built entirely in
    /// memory before being written out, or loaded into memory ahead of
    /// editing so a crash mid-edit can never touch the file on disk.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Hive { backend: Backend::Mem(MemView::new(data)) }
    }

    /// Reads the current base block without opening a session.
    pub fn base_block(&self) -> Result<BaseBlock> {
        BaseBlock::parse(self.backend.as_bytes())
    }

    /// Applies `plan` under one transaction. Equivalent to
    /// [`Hive::apply_cancellable`] with a cancel function that never fires.
    pub fn apply(&mut self, plan: &Plan, options: &SessionOptions) -> Result<ApplyReport> {
        self.apply_cancellable(plan, options, || false)
    }

    /// Applies `plan` under one transaction, polling `cancel` between ops;
    /// a `true` return aborts the whole plan via rollback.
    pub fn apply_cancellable(
        &mut self,
        plan: &Plan,
        options: &SessionOptions,
        cancel: impl FnMut() -> bool,
    ) -> Result<ApplyReport> {
        let mut session = Session::open(&mut self.backend, options)?;
        session.apply(plan, options, cancel)
    }

    /// Copies out the hive's current raw bytes, e.g. to persist an
    /// in-memory hive built via [`Hive::from_bytes`] to a file.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.backend.as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocOptions, Allocator};
    use crate::cell::{self, CellClass};
    use crate::hbin::HbinHeader;
    use crate::header::BASE_BLOCK_SIZE;
    use crate::key::KeyNode;
    use crate::plan::Op;
    use crate::utils::{cell_offset_to_absolute, HBIN_START_OFFSET, INVALID_OFFSET};
    use crate::value::ValueData;

    fn fresh_hive_bytes() -> Vec<u8> {
        let mut data = vec![0u8; BASE_BLOCK_SIZE + 0x100000];
        let root = KeyNode::new("ROOT", INVALID_OFFSET, true);
        let root_len = root.encoded_len();

        HbinHeader::format_new(&mut data[HBIN_START_OFFSET as usize..], 0, 0x100000).unwrap();
        let free_size = 0x100000 - crate::hbin::HBIN_HEADER_SIZE as u32;
        cell::write_cell_header(
            &mut data,
            (HBIN_START_OFFSET + crate::hbin::HBIN_HEADER_SIZE as u32) as usize,
            free_size,
            false,
        )
        .unwrap();

        let mut view = MemView::new(data);
        let mut alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();
        let root_offset = alloc.alloc(&mut view, root_len, CellClass::Nk).unwrap();
        let abs = cell_offset_to_absolute(root_offset).unwrap();
        let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
        root.write(&mut view.as_bytes_mut()[(abs + 4) as usize..(abs + size) as usize]).unwrap();

        BaseBlock::format_new(view.as_bytes_mut(), root_offset, 0x100000).unwrap();
        view.into_bytes()
    }

    #[test]
    fn test_apply_through_hive_facade() {
        let mut hive = Hive::from_bytes(fresh_hive_bytes());
        let options = SessionOptions { engine_mode: crate::session::EngineMode::SinglePass, ..Default::default() };

        let plan = Plan {
            ops: vec![Op::SetValue {
                key_path: vec!["Software".into(), "Vendor".into()],
                value_name: "Installed".into(),
                value_type: "REG_DWORD".into(),
                data: ValueData::Dword(1).encode().0,
            }],
        };

        let report = hive.apply(&plan, &options).unwrap();
        assert_eq!(report.ops_applied, 1);
        assert!(hive.base_block().unwrap().is_consistent());
    }

    #[test]
    fn test_apply_twice_reuses_fresh_session_each_time() {
        let mut hive = Hive::from_bytes(fresh_hive_bytes());
        let options = SessionOptions { engine_mode: crate::session::EngineMode::SinglePass, ..Default::default() };

        let plan1 = Plan { ops: vec![Op::EnsureKey { key_path: vec!["Software".into()] }] };
        let plan2 = Plan { ops: vec![Op::EnsureKey { key_path: vec!["Software".into(), "Vendor".into()] }] };

        hive.apply(&plan1, &options).unwrap();
        hive.apply(&plan2, &options).unwrap();
        assert!(hive.base_block().unwrap().is_consistent());
    }
}
