//! Dual-sequence transaction manager.
//!
//! A session wraps every batch of mutations in begin/commit so the base
//! block's primary and secondary sequence numbers stay the crash marker
//! spec §4.4 describes: while a transaction is open, `primary > secondary`;
//! `commit` brings them back in sync only after the data pages are durable.
//! Rollback here is best-effort: we never attempted a real mmap undo, we
//! just leave the sequence mismatch in place so a later reader can tell the
//! hive was left mid-write.

use crate::error::{RegistryError, Result};
use crate::header::{
    self, BaseBlock, CHECKSUM_OFFSET, HIVE_LENGTH_OFFSET, LAST_WRITTEN_OFFSET,
    PRIMARY_SEQ_OFFSET, ROOT_CELL_OFFSET_OFFSET, SECONDARY_SEQ_OFFSET,
};
use crate::utils::{calculate_checksum, read_u32_le, write_u32_le};
use tracing::{debug, instrument};

/// How aggressively `commit` flushes pages to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush dirty data pages, then the header page (default).
    #[default]
    Auto,
    /// Flush only dirty data pages; caller flushes the header separately.
    DataOnly,
    /// Flush the whole mapped region unconditionally.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Open,
}

/// Tracks the open/closed state of a transaction and mutates the base
/// block's sequence numbers at the right points.
#[derive(Debug)]
pub struct TransactionManager {
    state: State,
    flush_mode: FlushMode,
}

impl TransactionManager {
    /// Creates a manager with the given default flush mode.
    pub fn new(flush_mode: FlushMode) -> Self {
        TransactionManager {
            state: State::Idle,
            flush_mode,
        }
    }

    /// True while a transaction is open (`begin` called, no `commit`/
    /// `rollback` yet).
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Bumps the primary sequence number and timestamp, marking the hive
    /// dirty. Must not be called while a transaction is already open.
    #[instrument(skip(self, data))]
    pub fn begin(&mut self, data: &mut [u8]) -> Result<()> {
        if self.state == State::Open {
            return Err(RegistryError::TransactionState(
                "begin called while a transaction is already open".into(),
            ));
        }

        let primary = read_u32_le(data, PRIMARY_SEQ_OFFSET)?;
        write_u32_le(data, PRIMARY_SEQ_OFFSET, primary.wrapping_add(1))?;
        header::write_filetime_now(data, LAST_WRITTEN_OFFSET)?;

        let checksum = calculate_checksum(&data[..header::BASE_BLOCK_SIZE]);
        write_u32_le(data, CHECKSUM_OFFSET, checksum)?;

        self.state = State::Open;
        debug!(new_primary = primary.wrapping_add(1), "transaction begun");
        Ok(())
    }

    /// Records the current HBIN-area length and root cell offset in the
    /// header ahead of commit, in case either changed (growth, a new root).
    pub fn set_layout(&self, data: &mut [u8], root_cell_offset: u32, hive_length: u32) -> Result<()> {
        write_u32_le(data, ROOT_CELL_OFFSET_OFFSET, root_cell_offset)?;
        write_u32_le(data, HIVE_LENGTH_OFFSET, hive_length)?;
        let checksum = calculate_checksum(&data[..header::BASE_BLOCK_SIZE]);
        write_u32_le(data, CHECKSUM_OFFSET, checksum)?;
        Ok(())
    }

    /// Sets `secondary_sequence := primary_sequence`, recomputes the
    /// checksum, and (depending on `flush`) flushes the mapping. Callers
    /// are responsible for flushing data pages *before* calling this, per
    /// the ordered-flush rule: data must hit disk before the header says
    /// the transaction is closed.
    ///
    /// `cancel` is checked once, before the header update — the suspension
    /// point spec §5 calls out as safe: data pages are already durable, so
    /// abandoning here (the transaction stays open, its crash marker
    /// in place) leaves the hive readable as it was before this commit.
    #[instrument(skip(self, data, cancel, flush), fields(mode = ?self.flush_mode))]
    pub fn commit(
        &mut self,
        data: &mut [u8],
        cancel: &mut dyn FnMut() -> bool,
        mut flush: impl FnMut(&mut [u8], FlushMode) -> Result<()>,
    ) -> Result<()> {
        if self.state != State::Open {
            return Err(RegistryError::TransactionState(
                "commit called without a matching begin".into(),
            ));
        }
        if cancel() {
            return Err(RegistryError::Cancelled);
        }

        let primary = read_u32_le(data, PRIMARY_SEQ_OFFSET)?;
        write_u32_le(data, SECONDARY_SEQ_OFFSET, primary)?;

        let checksum = calculate_checksum(&data[..header::BASE_BLOCK_SIZE]);
        write_u32_le(data, CHECKSUM_OFFSET, checksum)?;

        flush(data, self.flush_mode)?;

        self.state = State::Idle;
        debug!(sequence = primary, "transaction committed");
        Ok(())
    }

    /// Leaves the sequence mismatch as-is (primary > secondary marks the
    /// hive as having an incomplete write) and returns to idle so a new
    /// `begin` can be attempted. No attempt is made to undo already-applied
    /// byte mutations; strategies are expected to validate before writing
    /// rather than rely on rollback to clean up after them.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Err(RegistryError::TransactionState(
                "rollback called without a matching begin".into(),
            ));
        }
        self.state = State::Idle;
        debug!("transaction rolled back (sequence mismatch left as crash marker)");
        Ok(())
    }

    /// Reparses the base block to check consistency (primary == secondary).
    pub fn is_consistent(&self, data: &[u8]) -> Result<bool> {
        Ok(BaseBlock::parse(data)?.is_consistent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BaseBlock;

    fn fresh_hive() -> Vec<u8> {
        let mut data = vec![0u8; 8192];
        BaseBlock::format_new(&mut data, 0x20, 4096).unwrap();
        data
    }

    #[test]
    fn test_begin_marks_inconsistent() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        assert!(BaseBlock::parse(&data).unwrap().is_consistent());
        txn.begin(&mut data).unwrap();
        assert!(!BaseBlock::parse(&data).unwrap().is_consistent());
    }

    #[test]
    fn test_commit_restores_consistency() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        txn.begin(&mut data).unwrap();
        txn.commit(&mut data, &mut || false, |_, _| Ok(())).unwrap();
        assert!(BaseBlock::parse(&data).unwrap().is_consistent());
        assert!(!txn.is_open());
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        txn.begin(&mut data).unwrap();
        let err = txn.begin(&mut data).unwrap_err();
        assert!(matches!(err, RegistryError::TransactionState(_)));
    }

    #[test]
    fn test_commit_without_begin_rejected() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        let err = txn.commit(&mut data, &mut || false, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, RegistryError::TransactionState(_)));
    }

    #[test]
    fn test_rollback_leaves_crash_marker() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        txn.begin(&mut data).unwrap();
        txn.rollback().unwrap();
        assert!(!BaseBlock::parse(&data).unwrap().is_consistent());
        assert!(!txn.is_open());
    }

    #[test]
    fn test_commit_respects_cancellation() {
        let mut data = fresh_hive();
        let mut txn = TransactionManager::new(FlushMode::Auto);

        txn.begin(&mut data).unwrap();
        let err = txn.commit(&mut data, &mut || true, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled));
        assert!(txn.is_open());
    }

    #[test]
    fn test_set_layout_updates_header_fields() {
        let mut data = fresh_hive();
        let txn = TransactionManager::new(FlushMode::Auto);
        txn.set_layout(&mut data, 0x40, 8192).unwrap();
        let base = BaseBlock::parse(&data).unwrap();
        assert_eq!(base.root_cell_offset, 0x40);
        assert_eq!(base.hive_length, 8192);
    }
}
