//! Write strategies: how a resized cell's replacement is allocated (spec
//! §4.2). All three share the same allocator and differ only in when they
//! reuse a cell in place versus move to a new one, and whether a vacated
//! cell is returned to the free list or left allocated.

use crate::allocator::Allocator;
use crate::cell::{self, CellClass};
use crate::error::Result;
use crate::utils::{cell_offset_to_absolute, round_cell_size};
use crate::view::HiveView;
use tracing::trace;

/// Default slack threshold for [`Hybrid`]: 12%.
pub const DEFAULT_SLACK_PCT: f64 = 0.12;

/// Decides where an updated cell's bytes end up.
pub trait Strategy: std::fmt::Debug {
    /// Places a payload of `new_payload_size` bytes of `class`, given the
    /// cell it is replacing (if any). Returns the cell offset to write the
    /// new payload into; the caller is responsible for actually writing
    /// the bytes and the length prefix.
    fn place(
        &self,
        view: &mut dyn HiveView,
        alloc: &mut Allocator,
        old_offset: Option<u32>,
        new_payload_size: u32,
        class: CellClass,
    ) -> Result<u32>;

    /// Whether a cell vacated outside of [`Strategy::place`] — e.g. an old
    /// subkey/value list cell being replaced by a rebuilt one — should be
    /// returned to the free list. [`Append`] says no; the other two say
    /// yes.
    fn should_free_vacated(&self) -> bool {
        true
    }
}

/// Reuses the existing cell whenever the new payload fits, freeing it and
/// allocating fresh only when it must move. Maximizes reuse; updates with a
/// steady payload size never touch the free list again after the first
/// allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlace;

impl Strategy for InPlace {
    fn place(
        &self,
        view: &mut dyn HiveView,
        alloc: &mut Allocator,
        old_offset: Option<u32>,
        new_payload_size: u32,
        class: CellClass,
    ) -> Result<u32> {
        let needed = round_cell_size(new_payload_size + 4);

        if let Some(old) = old_offset {
            let old_total = cell_total_size(view, old)?;
            if needed <= old_total {
                trace!(offset = old, "in-place reuse");
                return Ok(old);
            }
            let fresh = alloc.alloc(view, new_payload_size, class)?;
            alloc.free(view, old, class)?;
            return Ok(fresh);
        }

        alloc.alloc(view, new_payload_size, class)
    }
}

/// Never reuses a cell and never frees one: every update allocates fresh
/// space, leaving the old cell allocated and orphaned. Trades space for
/// never invalidating an in-flight reader's view of the old bytes before a
/// commit lands — a crash mid-write can never leave a cell half-overwritten
/// by two different logical values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Append;

impl Strategy for Append {
    fn place(
        &self,
        view: &mut dyn HiveView,
        alloc: &mut Allocator,
        _old_offset: Option<u32>,
        new_payload_size: u32,
        class: CellClass,
    ) -> Result<u32> {
        alloc.alloc(view, new_payload_size, class)
    }

    fn should_free_vacated(&self) -> bool {
        false
    }
}

/// Reuses a cell in place as long as the leftover slack stays under
/// `slack_pct` of the cell's size; once an update would waste more than
/// that, treats it like [`Append`] (new cell, old one left allocated)
/// rather than pay for a free-then-realloc on a cell that's about to be
/// resized again.
#[derive(Debug, Clone, Copy)]
pub struct Hybrid {
    /// Fraction of a reused cell's bytes allowed to go to waste, in
    /// `0.0..=1.0`.
    pub slack_pct: f64,
}

impl Default for Hybrid {
    fn default() -> Self {
        Hybrid { slack_pct: DEFAULT_SLACK_PCT }
    }
}

impl Strategy for Hybrid {
    fn place(
        &self,
        view: &mut dyn HiveView,
        alloc: &mut Allocator,
        old_offset: Option<u32>,
        new_payload_size: u32,
        class: CellClass,
    ) -> Result<u32> {
        let needed = round_cell_size(new_payload_size + 4);

        if let Some(old) = old_offset {
            let old_total = cell_total_size(view, old)?;
            if needed <= old_total {
                let slack = old_total - needed;
                let slack_pct = f64::from(slack) / f64::from(old_total);
                if slack_pct <= self.slack_pct {
                    trace!(offset = old, slack_pct, "hybrid in-place reuse");
                    return Ok(old);
                }
                trace!(offset = old, slack_pct, "hybrid slack exceeded, appending");
                return alloc.alloc(view, new_payload_size, class);
            }
            return alloc.alloc(view, new_payload_size, class);
        }

        alloc.alloc(view, new_payload_size, class)
    }
}

fn cell_total_size(view: &dyn HiveView, cell_offset: u32) -> Result<u32> {
    let abs = cell_offset_to_absolute(cell_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    Ok(size)
}

/// Builds the configured strategy from its name (`"in_place"`, `"append"`,
/// or `"hybrid"`), the shape [`crate::session::SessionOptions`] stores it
/// in before construction.
pub fn from_name(name: &str, slack_pct: f64) -> Option<Box<dyn Strategy>> {
    match name {
        "in_place" => Some(Box::new(InPlace)),
        "append" => Some(Box::new(Append)),
        "hybrid" => Some(Box::new(Hybrid { slack_pct })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocOptions;
    use crate::hbin::HbinHeader;
    use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
    use crate::utils::HBIN_START_OFFSET;
    use crate::view::MemView;

    fn fresh_hive() -> (MemView, Allocator) {
        let mut data = vec![0u8; BASE_BLOCK_SIZE + 0x10000];
        BaseBlock::format_new(&mut data, 0, 0x10000).unwrap();
        HbinHeader::format_new(&mut data[HBIN_START_OFFSET as usize..], 0, 0x10000).unwrap();
        let free_size = 0x10000 - crate::hbin::HBIN_HEADER_SIZE as u32;
        cell::write_cell_header(
            &mut data,
            (HBIN_START_OFFSET + crate::hbin::HBIN_HEADER_SIZE as u32) as usize,
            free_size,
            false,
        )
        .unwrap();
        let view = MemView::new(data);
        let alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();
        (view, alloc)
    }

    #[test]
    fn test_in_place_reuses_when_it_fits() {
        let (mut view, mut alloc) = fresh_hive();
        let strat = InPlace;
        let first = strat.place(&mut view, &mut alloc, None, 40, CellClass::Vk).unwrap();
        let second = strat.place(&mut view, &mut alloc, Some(first), 20, CellClass::Vk).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_in_place_moves_and_frees_when_too_small() {
        let (mut view, mut alloc) = fresh_hive();
        let strat = InPlace;
        let first = strat.place(&mut view, &mut alloc, None, 8, CellClass::Vk).unwrap();
        let second = strat.place(&mut view, &mut alloc, Some(first), 4000, CellClass::Vk).unwrap();
        assert_ne!(first, second);
        let stats = alloc.stats(&view);
        assert!(stats.free_cell_count >= 1);
    }

    #[test]
    fn test_append_never_reuses_and_never_frees() {
        let (mut view, mut alloc) = fresh_hive();
        let strat = Append;
        let first = strat.place(&mut view, &mut alloc, None, 8, CellClass::Vk).unwrap();
        let before = alloc.stats(&view);
        let second = strat.place(&mut view, &mut alloc, Some(first), 8, CellClass::Vk).unwrap();
        let after = alloc.stats(&view);
        assert_ne!(first, second);
        assert_eq!(before.free_cell_count, after.free_cell_count);
    }

    #[test]
    fn test_hybrid_falls_through_when_slack_high() {
        let (mut view, mut alloc) = fresh_hive();
        let strat = Hybrid { slack_pct: 0.1 };
        let first = strat.place(&mut view, &mut alloc, None, 1000, CellClass::Vk).unwrap();
        let before = alloc.stats(&view);
        let second = strat.place(&mut view, &mut alloc, Some(first), 8, CellClass::Vk).unwrap();
        let after = alloc.stats(&view);
        assert_ne!(first, second);
        assert_eq!(before.free_cell_count, after.free_cell_count);
    }

    #[test]
    fn test_from_name() {
        assert!(from_name("in_place", 0.12).is_some());
        assert!(from_name("append", 0.12).is_some());
        assert!(from_name("hybrid", 0.12).is_some());
        assert!(from_name("bogus", 0.12).is_none());
    }
}
