//! Allocator and HBIN manager (spec §4.1).
//!
//! Free space is tracked with one size-indexed free list per [`CellClass`].
//! Allocation is lowest-offset best-fit within a class, falling back to the
//! generic `Raw` bucket, and finally to growing the HBIN area by a fixed
//! chunk (default 1 MiB) or exactly enough to satisfy the request, whichever
//! is larger. A reverse `offset -> (class, size)` index lets `free` merge a
//! newly-freed cell into an immediately-following free cell regardless of
//! which class it was filed under.

use crate::cell::{self, CellClass};
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use crate::header::BASE_BLOCK_SIZE;
use crate::utils::{
    absolute_to_cell_offset, cell_offset_to_absolute, round_cell_size, round_hbin_size,
    HBIN_START_OFFSET,
};
use crate::view::HiveView;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument, warn};

/// Default hbin growth chunk: 1 MiB.
pub const DEFAULT_HBIN_GROWTH: u32 = 0x10_0000;

/// Tuning knobs for HBIN growth.
#[derive(Debug, Clone, Copy)]
pub struct AllocOptions {
    /// Minimum size of a newly appended hbin, rounded up to 4096 bytes.
    pub hbin_growth: u32,
    /// If set, new hbins are padded so the HBIN area's total length is a
    /// multiple of this many bytes (e.g. to line up with storage stripes).
    pub stripe_align: Option<u32>,
}

impl Default for AllocOptions {
    fn default() -> Self {
        AllocOptions {
            hbin_growth: DEFAULT_HBIN_GROWTH,
            stripe_align: None,
        }
    }
}

/// A snapshot of allocator occupancy, for diagnostics and the hybrid
/// strategy's slack threshold.
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Total bytes in the HBIN area (excludes the base block).
    pub total_bytes: u64,
    /// Bytes currently held by free cells.
    pub free_bytes: u64,
    /// Number of free cells tracked across all classes.
    pub free_cell_count: usize,
    /// Occupancy broken down per hbin, in on-disk order.
    pub per_hbin: Vec<HbinStats>,
}

impl AllocatorStats {
    /// Fraction of the HBIN area that is free, in `0.0..=1.0`.
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.free_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Occupancy for a single hbin, part of [`AllocatorStats::per_hbin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HbinStats {
    /// Absolute offset of this hbin's header.
    pub offset: u32,
    /// Total size of this hbin in bytes, header included.
    pub total_bytes: u32,
    /// Bytes currently held by free cells in this hbin.
    pub free_bytes: u64,
    /// Number of free cells in this hbin.
    pub free_cell_count: usize,
}

impl HbinStats {
    /// Fraction of this hbin that is free, in `0.0..=1.0`.
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.free_bytes as f64 / f64::from(self.total_bytes)
        }
    }
}

/// Segregated-free-list allocator over a growable [`HiveView`].
pub struct Allocator {
    options: AllocOptions,
    free_by_class: HashMap<CellClass, BTreeMap<u32, BTreeSet<u32>>>,
    free_index: HashMap<u32, (CellClass, u32)>,
    dirty_pages: BTreeSet<u32>,
    header_dirty: bool,
}

impl Allocator {
    /// Creates an allocator with no knowledge of existing free cells. Use
    /// [`Allocator::scan`] when opening a hive that may already have holes.
    pub fn new(options: AllocOptions) -> Self {
        let mut free_by_class = HashMap::new();
        for class in CellClass::ALL {
            free_by_class.insert(class, BTreeMap::new());
        }
        Allocator {
            options,
            free_by_class,
            free_index: HashMap::new(),
            dirty_pages: BTreeSet::new(),
            header_dirty: false,
        }
    }

    /// Walks every hbin in `view` and indexes existing free cells. All
    /// pre-existing free cells are filed under [`CellClass::Raw`] since
    /// their original type is not recoverable once freed; subsequent
    /// `free` calls during the session file cells under the class the
    /// caller actually used them as.
    #[instrument(skip(view))]
    pub fn scan(options: AllocOptions, view: &dyn HiveView) -> Result<Self> {
        let mut allocator = Allocator::new(options);
        let data = view.as_bytes();
        let mut hbin_abs = HBIN_START_OFFSET;

        while (hbin_abs as usize) < data.len() {
            let hbin_rel = hbin_abs - HBIN_START_OFFSET;
            let header = HbinHeader::parse(&data[hbin_abs as usize..], hbin_rel)?;
            let data_start = hbin_abs as usize + HBIN_HEADER_SIZE;
            let data_end = hbin_abs as usize + header.size as usize;
            if data_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset: hbin_abs,
                    expected: header.size as usize,
                    actual: data.len() - hbin_abs as usize,
                });
            }

            let mut cursor = data_start;
            while cursor < data_end {
                let (size, is_allocated) = cell::read_cell_header(data, cursor)?;
                cell::validate_cell_size(size, (cursor - HBIN_START_OFFSET as usize) as u32)?;
                if !is_allocated {
                    let rel = absolute_to_cell_offset(cursor as u32)?;
                    allocator.file_free(CellClass::Raw, rel, size);
                }
                cursor += size as usize;
            }

            hbin_abs += header.size;
        }

        debug!(free_cells = allocator.free_index.len(), "allocator scan complete");
        Ok(allocator)
    }

    /// Allocates a cell able to hold `payload_size` bytes of `class` data,
    /// returning its relative cell offset. Grows the HBIN area if no free
    /// cell is large enough.
    #[instrument(skip(self, view))]
    pub fn alloc(&mut self, view: &mut dyn HiveView, payload_size: u32, class: CellClass) -> Result<u32> {
        let needed = round_cell_size(payload_size + 4);

        if let Some(offset) = self.take_best_fit(class, needed) {
            return self.carve(view, offset, needed, class);
        }
        if class != CellClass::Raw {
            if let Some(offset) = self.take_best_fit(CellClass::Raw, needed) {
                return self.carve(view, offset, needed, class);
            }
        }
        self.grow_and_alloc(view, needed, class)
    }

    /// Marks a previously allocated cell as free and eligible for reuse
    /// under `class`. Attempts to merge with an immediately following free
    /// cell in the same hbin.
    #[instrument(skip(self, view))]
    pub fn free(&mut self, view: &mut dyn HiveView, cell_offset: u32, class: CellClass) -> Result<()> {
        let abs = cell_offset_to_absolute(cell_offset)?;
        let (mut size, is_allocated) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
        if !is_allocated {
            return Err(RegistryError::InvalidFormat(format!(
                "double free at cell offset {:#x}",
                cell_offset
            )));
        }

        let mut merge_class = class;
        if let Some(next_abs) = self.same_hbin_next(view.as_bytes(), abs, size)? {
            if let Some(&(next_class, next_size)) = self.free_index.get(&next_abs) {
                self.remove_free(next_class, next_abs, next_size);
                size += next_size;
                merge_class = next_class;
            }
        }

        cell::write_cell_header(view.as_bytes_mut(), abs as usize, size, false)?;
        self.mark_dirty(abs, size);
        self.file_free(merge_class, absolute_to_cell_offset(abs)?, size);
        Ok(())
    }

    /// Returns occupancy statistics over `view`, aggregate and per-hbin
    /// (spec §4.1's "efficiency reporting"). Walks the hbin chain to bucket
    /// `view` — not on the hot path, intended for UI/diagnostics use.
    pub fn stats(&self, view: &dyn HiveView) -> AllocatorStats {
        let free_bytes: u64 = self.free_index.values().map(|&(_, size)| u64::from(size)).sum();
        AllocatorStats {
            total_bytes: u64::from(view.len().saturating_sub(HBIN_START_OFFSET)),
            free_bytes,
            free_cell_count: self.free_index.len(),
            per_hbin: self.hbin_stats(view),
        }
    }

    fn hbin_stats(&self, view: &dyn HiveView) -> Vec<HbinStats> {
        let data = view.as_bytes();
        let mut out = Vec::new();
        let mut hbin_abs = HBIN_START_OFFSET;

        while (hbin_abs as usize) < data.len() {
            let header = match HbinHeader::parse(&data[hbin_abs as usize..], hbin_abs - HBIN_START_OFFSET) {
                Ok(header) => header,
                Err(_) => break,
            };
            let hbin_end = hbin_abs + header.size;

            let mut free_bytes = 0u64;
            let mut free_cell_count = 0usize;
            for (&abs, &(_, size)) in &self.free_index {
                if abs >= hbin_abs && abs < hbin_end {
                    free_bytes += u64::from(size);
                    free_cell_count += 1;
                }
            }

            out.push(HbinStats {
                offset: hbin_abs,
                total_bytes: header.size,
                free_bytes,
                free_cell_count,
            });
            hbin_abs = hbin_end;
        }

        out
    }

    /// Page indices (4096-byte pages, absolute-offset based) touched since
    /// the tracker was last cleared. The header page (page 0) is tracked
    /// separately by the transaction manager.
    pub fn dirty_pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirty_pages.iter().copied()
    }

    /// True if any data page is dirty.
    pub fn has_dirty_pages(&self) -> bool {
        !self.dirty_pages.is_empty()
    }

    /// True if the base block itself needs rewriting.
    pub fn header_dirty(&self) -> bool {
        self.header_dirty
    }

    /// Marks the header page dirty; called by code that writes header
    /// fields directly (the transaction manager).
    pub fn mark_header_dirty(&mut self) {
        self.header_dirty = true;
    }

    /// Clears all dirty tracking after a successful flush.
    pub fn clear_dirty(&mut self) {
        self.dirty_pages.clear();
        self.header_dirty = false;
    }

    fn mark_dirty(&mut self, abs_offset: u32, size: u32) {
        let first_page = abs_offset / 4096;
        let last_page = (abs_offset + size.max(1) - 1) / 4096;
        for page in first_page..=last_page {
            self.dirty_pages.insert(page);
        }
    }

    fn file_free(&mut self, class: CellClass, rel_offset: u32, size: u32) {
        self.free_by_class
            .entry(class)
            .or_default()
            .entry(size)
            .or_default()
            .insert(rel_offset);
        self.free_index.insert(
            cell_offset_to_absolute(rel_offset).unwrap_or(rel_offset),
            (class, size),
        );
    }

    fn remove_free(&mut self, class: CellClass, abs_offset: u32, size: u32) {
        if let Ok(rel) = absolute_to_cell_offset(abs_offset) {
            if let Some(bucket) = self.free_by_class.get_mut(&class) {
                if let Some(set) = bucket.get_mut(&size) {
                    set.remove(&rel);
                    if set.is_empty() {
                        bucket.remove(&size);
                    }
                }
            }
        }
        self.free_index.remove(&abs_offset);
    }

    /// Finds the smallest free cell in `class` that is at least `needed`
    /// bytes, preferring the lowest offset among ties, and removes it from
    /// the free list. Returns the relative cell offset.
    fn take_best_fit(&mut self, class: CellClass, needed: u32) -> Option<u32> {
        let bucket = self.free_by_class.get(&class)?;
        let (&size, offsets) = bucket.range(needed..).next()?;
        let rel_offset = *offsets.iter().next()?;
        self.remove_free(class, cell_offset_to_absolute(rel_offset).ok()?, size);
        Some(rel_offset)
    }

    /// Writes the allocated header into a free cell found by `take_best_fit`,
    /// splitting off trailing slack back into the free list when it is
    /// large enough to be its own cell.
    fn carve(&mut self, view: &mut dyn HiveView, rel_offset: u32, needed: u32, class: CellClass) -> Result<u32> {
        let abs = cell_offset_to_absolute(rel_offset)?;
        let (found_size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;

        let give_size = if found_size - needed >= crate::utils::MIN_CELL_SIZE {
            let slack_abs = abs + needed;
            let slack_size = found_size - needed;
            cell::write_cell_header(view.as_bytes_mut(), slack_abs as usize, slack_size, false)?;
            self.file_free(CellClass::Raw, absolute_to_cell_offset(slack_abs)?, slack_size);
            needed
        } else {
            found_size
        };

        cell::write_cell_header(view.as_bytes_mut(), abs as usize, give_size, true)?;
        self.mark_dirty(abs, give_size);
        let _ = class;
        Ok(rel_offset)
    }

    /// Appends a new hbin large enough to satisfy `needed`, carving the
    /// request out of its front and filing any remainder as free space.
    fn grow_and_alloc(&mut self, view: &mut dyn HiveView, needed: u32, class: CellClass) -> Result<u32> {
        let old_len = view.len();
        let requested_total = HBIN_HEADER_SIZE as u32 + needed;
        let mut chunk = round_hbin_size(self.options.hbin_growth.max(requested_total));
        if let Some(stripe) = self.options.stripe_align {
            let prospective_total = old_len - BASE_BLOCK_SIZE as u32 + chunk;
            let aligned = prospective_total.div_ceil(stripe) * stripe;
            chunk += aligned - prospective_total;
        }

        view.grow(old_len + chunk)?;

        let hbin_rel = old_len - HBIN_START_OFFSET;
        HbinHeader::format_new(&mut view.as_bytes_mut()[old_len as usize..], hbin_rel, chunk)?;
        self.mark_dirty(old_len, chunk);

        let cell_abs = old_len + HBIN_HEADER_SIZE as u32;
        let available = chunk - HBIN_HEADER_SIZE as u32;
        let give_size = if available - needed >= crate::utils::MIN_CELL_SIZE {
            let slack_abs = cell_abs + needed;
            let slack_size = available - needed;
            cell::write_cell_header(view.as_bytes_mut(), slack_abs as usize, slack_size, false)?;
            self.file_free(CellClass::Raw, absolute_to_cell_offset(slack_abs)?, slack_size);
            needed
        } else {
            available
        };

        cell::write_cell_header(view.as_bytes_mut(), cell_abs as usize, give_size, true)?;
        self.mark_dirty(cell_abs, give_size);
        let _ = class;

        warn!(bytes = chunk, "grew hbin area");
        absolute_to_cell_offset(cell_abs)
    }

    /// Returns the absolute offset of the cell immediately following the
    /// cell at `abs..abs+size`, if that offset still lies within the same
    /// hbin (otherwise `None`, since cross-hbin merges are never valid).
    fn same_hbin_next(&self, data: &[u8], abs: u32, size: u32) -> Result<Option<u32>> {
        let mut hbin_abs = HBIN_START_OFFSET;
        while (hbin_abs as usize) < data.len() {
            let header = HbinHeader::parse(&data[hbin_abs as usize..], hbin_abs - HBIN_START_OFFSET)?;
            let hbin_end = hbin_abs + header.size;
            if abs >= hbin_abs && abs < hbin_end {
                let next = abs + size;
                return Ok(if next < hbin_end { Some(next) } else { None });
            }
            hbin_abs = hbin_end;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BaseBlock;
    use crate::view::MemView;

    fn fresh_hive(hbin_len: u32) -> MemView {
        let mut data = vec![0u8; BASE_BLOCK_SIZE + hbin_len as usize];
        BaseBlock::format_new(&mut data, 0, hbin_len).unwrap();
        HbinHeader::format_new(&mut data[HBIN_START_OFFSET as usize..], 0, hbin_len).unwrap();
        let free_size = hbin_len - HBIN_HEADER_SIZE as u32;
        cell::write_cell_header(&mut data, (HBIN_START_OFFSET + HBIN_HEADER_SIZE as u32) as usize, free_size, false).unwrap();
        MemView::new(data)
    }

    #[test]
    fn test_alloc_from_existing_free_cell() {
        let mut view = fresh_hive(4096);
        let mut alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();

        let offset = alloc.alloc(&mut view, 40, CellClass::Nk).unwrap();
        let abs = cell_offset_to_absolute(offset).unwrap();
        let (size, is_allocated) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
        assert!(is_allocated);
        assert!(size >= 44);
    }

    #[test]
    fn test_alloc_grows_when_no_space() {
        let mut view = fresh_hive(4096);
        let mut alloc = Allocator::new(AllocOptions::default());

        let offset = alloc.alloc(&mut view, 40, CellClass::Nk).unwrap();
        assert!(view.len() > BASE_BLOCK_SIZE as u32 + 4096);
        let abs = cell_offset_to_absolute(offset).unwrap();
        let (_, is_allocated) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
        assert!(is_allocated);
    }

    #[test]
    fn test_free_then_realloc_reuses_cell() {
        let mut view = fresh_hive(4096);
        let mut alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();

        let offset = alloc.alloc(&mut view, 40, CellClass::Vk).unwrap();
        alloc.free(&mut view, offset, CellClass::Vk).unwrap();

        let stats_before = alloc.stats(&view);
        assert!(stats_before.free_cell_count >= 1);

        let offset2 = alloc.alloc(&mut view, 40, CellClass::Vk).unwrap();
        assert_eq!(offset, offset2);
    }

    #[test]
    fn test_double_free_is_error() {
        let mut view = fresh_hive(4096);
        let mut alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();
        let offset = alloc.alloc(&mut view, 40, CellClass::Vk).unwrap();
        alloc.free(&mut view, offset, CellClass::Vk).unwrap();
        assert!(alloc.free(&mut view, offset, CellClass::Vk).is_err());
    }

    #[test]
    fn test_scan_indexes_existing_free_cells() {
        let view = fresh_hive(4096);
        let alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();
        let stats = alloc.stats(&view);
        assert_eq!(stats.free_cell_count, 1);
        assert_eq!(stats.free_bytes, 4096 - HBIN_HEADER_SIZE as u64);
    }

    #[test]
    fn test_stats_reports_per_hbin_breakdown() {
        let mut view = fresh_hive(4096);
        let mut alloc = Allocator::new(AllocOptions { hbin_growth: 4096, stripe_align: None });
        // Force growth into a second hbin.
        alloc.alloc(&mut view, 4000, CellClass::Nk).unwrap();
        alloc.alloc(&mut view, 40, CellClass::Vk).unwrap();

        let stats = alloc.stats(&view);
        assert_eq!(stats.per_hbin.len(), 2);
        assert_eq!(stats.per_hbin[0].offset, HBIN_START_OFFSET);
        let total_free: u64 = stats.per_hbin.iter().map(|h| h.free_bytes).sum();
        assert_eq!(total_free, stats.free_bytes);
    }
}
