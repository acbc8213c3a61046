//! Session: applies a [`Plan`] to a hive under one transaction (spec §5, §6).
//!
//! A session picks one of two apply engines up front. The full-index engine
//! walks the whole tree once into a [`HiveIndex`] and keeps it updated as
//! ops run, trading the up-front walk for O(1) lookups on every subsequent
//! op. The single-pass engine builds a pruned index instead: only the
//! subtree an op's path could touch is walked, resolved by following each
//! parent's subkey-list name hints rather than decoding every sibling.
//!
//! New children created mid-plan aren't linked into their parent's subkey
//! list one at a time — that would rebuild the full sibling list on every
//! insertion, the O(n²) pattern deferred batching exists to avoid (spec
//! §4.2). Instead they're held in `deferred_children` and flushed into one
//! freshly-built list per parent, just once, before commit.

use crate::allocator::{AllocOptions, Allocator};
use crate::bigdata::{self, BigDataBlock};
use crate::cell::{self, CellClass};
use crate::error::{RegistryError, Result};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::index::{self, CapacityHint, HiveIndex};
use crate::key::KeyNode;
use crate::plan::{decode_value_data, Op, Plan};
use crate::strategy::{self, Strategy};
use crate::subkey_list::{self, SubkeyListEntry};
use crate::transaction::{FlushMode, TransactionManager};
use crate::utils::{ascii_lower, cell_offset_to_absolute, name_hint, read_u32_le, INVALID_OFFSET};
use crate::value::ValueKey;
use crate::view::HiveView;
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument};

/// Which apply engine a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    /// Picks full-index or single-pass based on `mode_threshold`.
    #[default]
    Auto,
    /// Always builds a full [`HiveIndex`] before applying ops.
    Full,
    /// Builds a pruned index covering just the ops' paths, and resolves
    /// lookups through it.
    SinglePass,
}

/// Tuning knobs for a session, mirroring the documented plan-apply options
/// (spec §6.4).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Which engine to use.
    pub engine_mode: EngineMode,
    /// In `Auto` mode, plans with at least this many ops use the full-index
    /// engine; smaller plans use single-pass.
    pub mode_threshold: usize,
    /// Write strategy name: `"in_place"`, `"append"`, or `"hybrid"`.
    pub strategy: String,
    /// Slack threshold for the `"hybrid"` strategy.
    pub slack_pct: f64,
    /// How aggressively `commit` flushes pages.
    pub flush_mode: FlushMode,
    /// Minimum size of a newly appended hbin, rounded up to 4096 bytes.
    pub grow_chunk: u32,
    /// If nonzero, new hbins are padded so the HBIN area's total length is a
    /// multiple of this many bytes (e.g. to line up with storage stripes).
    pub stripe_unit: u32,
    /// Advise the OS to back the mapping with huge pages where supported.
    pub huge_pages: bool,
    /// Advise the OS to prefetch the whole mapping on open.
    pub willneed_hint: bool,
    /// Initial capacity hint for the key index, or `0` to auto-estimate.
    pub nk_capacity: usize,
    /// Initial capacity hint for the value index, or `0` to auto-estimate.
    pub vk_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            engine_mode: EngineMode::Auto,
            mode_threshold: 100,
            strategy: "hybrid".to_string(),
            slack_pct: strategy::DEFAULT_SLACK_PCT,
            flush_mode: FlushMode::Auto,
            grow_chunk: crate::allocator::DEFAULT_HBIN_GROWTH,
            stripe_unit: 0,
            huge_pages: false,
            willneed_hint: false,
            nk_capacity: 0,
            vk_capacity: 0,
        }
    }
}

/// Outcome of a successful [`Session::apply`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReport {
    /// Number of ops applied, including no-ops (e.g. `ensure_key` on an
    /// already-existing key).
    pub ops_applied: usize,
    /// Which engine actually ran.
    pub engine_used: &'static str,
    /// New key segments created, across both explicit `ensure_key` ops and
    /// ancestors implicitly created by `set_value`.
    pub keys_created: usize,
    /// Keys removed by a `delete_key` op that found something to remove.
    pub keys_deleted: usize,
    /// Values written by `set_value`, whether created or overwritten.
    pub values_set: usize,
    /// Values removed by a `delete_value` op that found something to remove.
    pub values_deleted: usize,
}

/// A child key awaiting a batched link into its parent's subkey list.
struct PendingChild {
    name: String,
    offset: u32,
}

/// An open hive, ready to have a plan applied to it under one transaction.
pub struct Session<'v> {
    view: &'v mut dyn HiveView,
    alloc: Allocator,
    txn: TransactionManager,
    strategy: Box<dyn Strategy>,
    index: Option<HiveIndex>,
    root_offset: u32,
    counters: ApplyReport,
    /// Children created mid-plan, not yet linked into their parent's
    /// on-disk subkey list. Flushed in one batch per parent before commit.
    deferred_children: HashMap<u32, Vec<PendingChild>>,
}

impl<'v> Session<'v> {
    /// Opens a session over an already-formatted hive, scanning its free
    /// space and reading the root cell offset from the base block.
    #[instrument(skip(view))]
    pub fn open(view: &'v mut dyn HiveView, options: &SessionOptions) -> Result<Self> {
        let base = BaseBlock::parse(view.as_bytes())?;
        view.advise(options.huge_pages, options.willneed_hint)?;

        let alloc_options = AllocOptions {
            hbin_growth: options.grow_chunk,
            stripe_align: if options.stripe_unit == 0 { None } else { Some(options.stripe_unit) },
        };
        let alloc = Allocator::scan(alloc_options, view)?;
        let strategy = strategy::from_name(&options.strategy, options.slack_pct)
            .ok_or_else(|| RegistryError::InvalidOption(format!("unknown strategy {:?}", options.strategy)))?;

        Ok(Session {
            view,
            alloc,
            txn: TransactionManager::new(options.flush_mode),
            strategy,
            index: None,
            root_offset: base.root_cell_offset,
            counters: ApplyReport::default(),
            deferred_children: HashMap::new(),
        })
    }

    /// Applies every op in `plan` under one transaction, polling `cancel`
    /// between ops (and, inside the index build and subtree deletes,
    /// between tree nodes). On any op failure or cancellation the
    /// transaction is rolled back (leaving the crash marker) and the error
    /// is returned.
    #[instrument(skip(self, plan, cancel))]
    pub fn apply(&mut self, plan: &Plan, options: &SessionOptions, mut cancel: impl FnMut() -> bool) -> Result<ApplyReport> {
        let use_full_index = match options.engine_mode {
            EngineMode::Full => true,
            EngineMode::SinglePass => false,
            EngineMode::Auto => plan.ops.len() >= options.mode_threshold,
        };

        self.counters = ApplyReport::default();
        self.deferred_children.clear();
        self.txn.begin(self.view.as_bytes_mut())?;

        let capacity = CapacityHint { nk: options.nk_capacity, vk: options.vk_capacity };
        let cancel_ref: &mut dyn FnMut() -> bool = &mut cancel;
        let result = self.run_plan(plan, use_full_index, capacity, cancel_ref);

        match result {
            Ok(ops_applied) => {
                let hbin_area_len = self.view.len() - BASE_BLOCK_SIZE as u32;
                self.txn.set_layout(self.view.as_bytes_mut(), self.root_offset, hbin_area_len)?;
                self.alloc.mark_header_dirty();

                // Ordered flush (spec §4.4): data pages must hit the backing
                // store before the header says the transaction is closed.
                self.view.flush()?;
                self.txn.commit(self.view.as_bytes_mut(), cancel_ref, |_, _| Ok(()))?;
                if !matches!(options.flush_mode, FlushMode::DataOnly) {
                    self.view.flush()?;
                }
                self.alloc.clear_dirty();

                let report = ApplyReport {
                    ops_applied,
                    engine_used: if use_full_index { "full_index" } else { "single_pass" },
                    ..self.counters
                };
                info!(
                    ops_applied,
                    keys_created = report.keys_created,
                    keys_deleted = report.keys_deleted,
                    values_set = report.values_set,
                    values_deleted = report.values_deleted,
                    "plan applied"
                );
                Ok(report)
            }
            Err(e) => {
                self.txn.rollback()?;
                Err(e)
            }
        }
    }

    /// Builds the index appropriate to `use_full_index`, runs every op, and
    /// flushes any deferred subkey links — the body of `apply` proper,
    /// split out so `apply` can route both success and failure through one
    /// `match` without fighting the borrow checker over `self`.
    fn run_plan(
        &mut self,
        plan: &Plan,
        use_full_index: bool,
        capacity: CapacityHint,
        cancel: &mut dyn FnMut() -> bool,
    ) -> Result<usize> {
        self.index = Some(if use_full_index {
            HiveIndex::build(self.view, self.root_offset, self.view.len() as u64, capacity, cancel)?
        } else {
            let wanted = children_by_parent(plan);
            HiveIndex::build_pruned(self.view, self.root_offset, &wanted, capacity, cancel)?
        });
        let applied = if use_full_index { self.run_ops(plan, cancel)? } else { self.run_ops_sorted(plan, cancel)? };
        self.flush_deferred_subkeys()?;
        Ok(applied)
    }

    fn run_ops(&mut self, plan: &Plan, cancel: &mut dyn FnMut() -> bool) -> Result<usize> {
        for (i, op) in plan.ops.iter().enumerate() {
            if cancel() {
                return Err(RegistryError::Cancelled);
            }
            self.apply_one(i, op, cancel)?;
        }
        Ok(plan.ops.len())
    }

    fn run_ops_sorted(&mut self, plan: &Plan, cancel: &mut dyn FnMut() -> bool) -> Result<usize> {
        let mut indexed: Vec<(usize, &Op)> = plan.ops.iter().enumerate().collect();
        indexed.sort_by(|(_, a), (_, b)| lower_path(a.key_path()).cmp(&lower_path(b.key_path())));

        for (i, op) in indexed {
            if cancel() {
                return Err(RegistryError::Cancelled);
            }
            self.apply_one(i, op, cancel)?;
        }
        Ok(plan.ops.len())
    }

    fn apply_one(&mut self, op_index: usize, op: &Op, cancel: &mut dyn FnMut() -> bool) -> Result<()> {
        let segments = op.key_path();

        let outcome = match op {
            Op::EnsureKey { .. } => self.ensure_key(segments).map(|_| ()),
            Op::SetValue { value_name, value_type, data, .. } => {
                self.set_value(segments, value_name, value_type, data)
            }
            Op::DeleteValue { value_name, .. } => self.delete_value(segments, value_name),
            Op::DeleteKey { .. } => self.delete_key(segments, cancel),
        };

        outcome.map_err(|e| RegistryError::apply_failed(op_index, op.kind(), segments, e))
    }

    // -- key/value resolution, shared by both engines --------------------

    fn find_child(&self, parent: u32, name: &str) -> Result<Option<u32>> {
        if let Some(pending) = self.deferred_children.get(&parent) {
            let wanted = ascii_lower(name);
            if let Some(child) = pending.iter().find(|c| c.name == wanted) {
                return Ok(Some(child.offset));
            }
        }
        if let Some(idx) = &self.index {
            return Ok(idx.find_key(parent, name));
        }
        direct_find_child(self.view, parent, name)
    }

    fn find_value(&self, key: u32, name: &str) -> Result<Option<u32>> {
        if let Some(idx) = &self.index {
            return Ok(idx.find_value(key, name));
        }
        direct_find_value(self.view, key, name)
    }

    fn note_key_created(&mut self, parent: u32, name: &str, offset: u32) {
        if let Some(idx) = &mut self.index {
            idx.insert_key(parent, name, offset);
        }
        self.counters.keys_created += 1;
    }

    fn note_key_removed(&mut self, parent: u32, name: &str) {
        if let Some(idx) = &mut self.index {
            idx.remove_key(parent, name);
        }
        self.counters.keys_deleted += 1;
    }

    fn note_value_created(&mut self, key: u32, name: &str, offset: u32) {
        if let Some(idx) = &mut self.index {
            idx.insert_value(key, name, offset);
        }
    }

    fn note_value_removed(&mut self, key: u32, name: &str) {
        if let Some(idx) = &mut self.index {
            idx.remove_value(key, name);
        }
        self.counters.values_deleted += 1;
    }

    // -- ensure_key --------------------------------------------------------

    /// Walks `segments` from the root, creating any missing key along the
    /// way, and returns the final key's cell offset.
    fn ensure_key(&mut self, segments: &[String]) -> Result<u32> {
        let mut current = self.root_offset;
        for seg in segments {
            current = match self.find_child(current, seg)? {
                Some(offset) => offset,
                None => {
                    let offset = self.create_child_key(current, seg)?;
                    self.note_key_created(current, seg, offset);
                    offset
                }
            };
        }
        Ok(current)
    }

    /// Resolves `segments` without creating anything; `Ok(None)` if any
    /// component along the path is missing.
    fn resolve_key(&self, segments: &[String]) -> Result<Option<u32>> {
        let mut current = self.root_offset;
        for seg in segments {
            match self.find_child(current, seg)? {
                Some(offset) => current = offset,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn create_child_key(&mut self, parent_offset: u32, name: &str) -> Result<u32> {
        let node = KeyNode::new(name, parent_offset, false);
        let offset = self.alloc.alloc(self.view, node.encoded_len(), CellClass::Nk)?;
        write_key_at(self.view, offset, &node)?;

        self.deferred_children
            .entry(parent_offset)
            .or_default()
            .push(PendingChild { name: ascii_lower(name), offset });

        let mut parent = index::read_key(self.view, parent_offset)?;
        parent.subkey_count += 1;
        write_key_at(self.view, parent_offset, &parent)?;
        Ok(offset)
    }

    /// Rebuilds one parent's subkey list from its on-disk children plus
    /// whatever accumulated in `deferred_children`, in a single pass.
    /// Called for every parent with pending children before commit (spec
    /// §4.2/§9): this is what turns per-insert O(n) rebuilds into one O(n)
    /// rebuild per parent regardless of how many children were added.
    fn flush_deferred_subkeys(&mut self) -> Result<()> {
        let parents: Vec<u32> = self.deferred_children.keys().copied().collect();
        for parent_offset in parents {
            let Some(pending) = self.deferred_children.remove(&parent_offset) else {
                continue;
            };
            if pending.is_empty() {
                continue;
            }

            let mut parent = index::read_key(self.view, parent_offset)?;
            let mut offsets = subkey_list::flatten(self.view, parent.subkey_list_offset)?;
            offsets.extend(pending.iter().map(|c| c.offset));

            let entries = self.entries_for(&offsets)?;
            let old_list = parent.subkey_list_offset;
            let new_list = subkey_list::build(self.view, &mut self.alloc, &entries)?;
            if old_list != INVALID_OFFSET && self.strategy.should_free_vacated() {
                subkey_list::free_existing(self.view, &mut self.alloc, old_list)?;
            }

            parent.subkey_count = entries.len() as u32;
            parent.subkey_list_offset = new_list;
            write_key_at(self.view, parent_offset, &parent)?;
        }
        Ok(())
    }

    fn entries_for(&self, offsets: &[u32]) -> Result<Vec<SubkeyListEntry>> {
        let mut entries = Vec::with_capacity(offsets.len());
        let mut named = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            let child = index::read_key(self.view, offset)?;
            named.push((ascii_lower(&child.name), offset));
        }
        named.sort();
        for (name, offset) in named {
            entries.push(SubkeyListEntry { key_offset: offset, name_hint: name_hint(&name) });
        }
        Ok(entries)
    }

    // -- set_value / delete_value -------------------------------------------

    fn set_value(&mut self, segments: &[String], name: &str, value_type: &str, data: &[u8]) -> Result<()> {
        let key_offset = self.ensure_key(segments)?;
        let value_data = decode_value_data(value_type, data)?;
        let (payload, vtype) = value_data.encode();

        match self.find_value(key_offset, name)? {
            Some(vk_offset) => self.overwrite_value(vk_offset, &payload, vtype)?,
            None => {
                let new_offset = self.create_value(&payload, vtype, name)?;
                self.link_value_into_key(key_offset, new_offset)?;
                self.note_value_created(key_offset, name, new_offset);
            }
        }
        self.counters.values_set += 1;
        Ok(())
    }

    fn overwrite_value(&mut self, vk_offset: u32, payload: &[u8], vtype: crate::cell::ValueType) -> Result<()> {
        let mut vk = index::read_value(self.view, vk_offset)?;
        let old_data_offset = if vk.is_inline_data() || vk.data_length == 0 {
            None
        } else {
            Some(vk.data_offset)
        };

        if payload.len() <= 4 {
            if let Some(old) = old_data_offset {
                if self.strategy.should_free_vacated() {
                    free_value_data(self.view, &mut self.alloc, old, vk.data_length)?;
                }
            }
            vk.place_data(payload, None);
        } else if payload.len() > bigdata::MAX_DIRECT_VALUE_SIZE {
            let new_offset = write_big_data(self.view, &mut self.alloc, payload)?;
            if let Some(old) = old_data_offset {
                if self.strategy.should_free_vacated() {
                    free_value_data(self.view, &mut self.alloc, old, vk.data_length)?;
                }
            }
            vk.place_data(payload, Some(new_offset));
        } else {
            let new_offset = self.strategy.place(self.view, &mut self.alloc, old_data_offset, payload.len() as u32, CellClass::Raw)?;
            write_payload_at(self.view, new_offset, payload)?;
            vk.place_data(payload, Some(new_offset));
        }

        vk.data_type = vtype;
        write_value_at(self.view, vk_offset, &vk)?;
        Ok(())
    }

    fn create_value(&mut self, payload: &[u8], vtype: crate::cell::ValueType, name: &str) -> Result<u32> {
        let mut vk = ValueKey::new(name, vtype);
        if payload.len() <= 4 {
            vk.place_data(payload, None);
        } else if payload.len() > bigdata::MAX_DIRECT_VALUE_SIZE {
            let data_offset = write_big_data(self.view, &mut self.alloc, payload)?;
            vk.place_data(payload, Some(data_offset));
        } else {
            let data_offset = self.alloc.alloc(self.view, payload.len() as u32, CellClass::Raw)?;
            write_payload_at(self.view, data_offset, payload)?;
            vk.place_data(payload, Some(data_offset));
        }
        let vk_offset = self.alloc.alloc(self.view, vk.encoded_len(), CellClass::Vk)?;
        write_value_at(self.view, vk_offset, &vk)?;
        Ok(vk_offset)
    }

    fn link_value_into_key(&mut self, key_offset: u32, vk_offset: u32) -> Result<()> {
        let mut key = index::read_key(self.view, key_offset)?;
        let mut offsets = index::read_value_list(self.view, key.value_list_offset, key.value_count)?;
        offsets.push(vk_offset);

        let old_list = key.value_list_offset;
        let new_list = build_value_list(self.view, &mut self.alloc, &offsets)?;
        if old_list != INVALID_OFFSET && self.strategy.should_free_vacated() {
            self.alloc.free(self.view, old_list, CellClass::Raw)?;
        }

        key.value_count = offsets.len() as u32;
        key.value_list_offset = new_list;
        write_key_at(self.view, key_offset, &key)?;
        Ok(())
    }

    fn delete_value(&mut self, segments: &[String], name: &str) -> Result<()> {
        let Some(key_offset) = self.resolve_key(segments)? else {
            return Ok(());
        };
        let Some(vk_offset) = self.find_value(key_offset, name)? else {
            return Ok(());
        };

        let vk = index::read_value(self.view, vk_offset)?;
        if !vk.is_inline_data() && vk.data_length > 0 {
            free_value_data(self.view, &mut self.alloc, vk.data_offset, vk.data_length)?;
        }
        self.alloc.free(self.view, vk_offset, CellClass::Vk)?;

        let mut key = index::read_key(self.view, key_offset)?;
        let mut offsets = index::read_value_list(self.view, key.value_list_offset, key.value_count)?;
        offsets.retain(|&o| o != vk_offset);

        let old_list = key.value_list_offset;
        let new_list = build_value_list(self.view, &mut self.alloc, &offsets)?;
        if old_list != INVALID_OFFSET && self.strategy.should_free_vacated() {
            self.alloc.free(self.view, old_list, CellClass::Raw)?;
        }
        key.value_count = offsets.len() as u32;
        key.value_list_offset = new_list;
        write_key_at(self.view, key_offset, &key)?;

        self.note_value_removed(key_offset, name);
        Ok(())
    }

    // -- delete_key ----------------------------------------------------------

    fn delete_key(&mut self, segments: &[String], cancel: &mut dyn FnMut() -> bool) -> Result<()> {
        if segments.is_empty() {
            return Err(RegistryError::EmptyKeyPath { op_index: 0 });
        }
        let Some(key_offset) = self.resolve_key(segments)? else {
            return Ok(());
        };

        let (parent_segments, name) = segments.split_at(segments.len() - 1);
        let parent_offset = self
            .resolve_key(parent_segments)?
            .expect("parent of a resolved key always resolves");
        let name = &name[0];

        self.destroy_subtree(key_offset, cancel)?;
        self.unlink_child_from_parent(parent_offset, key_offset)?;
        self.note_key_removed(parent_offset, name);
        Ok(())
    }

    /// Frees a key and everything under it, without touching its parent's
    /// subkey list (the caller unlinks the top-level key itself; recursive
    /// calls destroy children whose parent cell is being destroyed anyway).
    /// Also purges any of this key's children still sitting in
    /// `deferred_children` (created earlier in the same plan, never
    /// flushed) so a delete within the same plan as the create doesn't
    /// leak their cells or leave a stale deferred entry behind.
    fn destroy_subtree(&mut self, key_offset: u32, cancel: &mut dyn FnMut() -> bool) -> Result<()> {
        if cancel() {
            return Err(RegistryError::Cancelled);
        }
        let key = index::read_key(self.view, key_offset)?;

        for child_offset in subkey_list::flatten(self.view, key.subkey_list_offset)? {
            self.destroy_subtree(child_offset, cancel)?;
        }
        if let Some(pending) = self.deferred_children.remove(&key_offset) {
            for child in pending {
                self.destroy_subtree(child.offset, cancel)?;
            }
        }
        if key.subkey_list_offset != INVALID_OFFSET {
            subkey_list::free_existing(self.view, &mut self.alloc, key.subkey_list_offset)?;
        }

        for vk_offset in index::read_value_list(self.view, key.value_list_offset, key.value_count)? {
            let vk = index::read_value(self.view, vk_offset)?;
            if !vk.is_inline_data() && vk.data_length > 0 {
                free_value_data(self.view, &mut self.alloc, vk.data_offset, vk.data_length)?;
            }
            self.alloc.free(self.view, vk_offset, CellClass::Vk)?;
        }
        if key.value_list_offset != INVALID_OFFSET {
            self.alloc.free(self.view, key.value_list_offset, CellClass::Raw)?;
        }

        self.alloc.free(self.view, key_offset, CellClass::Nk)?;
        Ok(())
    }

    fn unlink_child_from_parent(&mut self, parent_offset: u32, child_offset: u32) -> Result<()> {
        if let Some(pending) = self.deferred_children.get_mut(&parent_offset) {
            if let Some(pos) = pending.iter().position(|c| c.offset == child_offset) {
                pending.remove(pos);
                // The child cell itself is already freed by destroy_subtree;
                // it was never linked into the on-disk list, so there's
                // nothing further to rebuild here.
                let mut parent = index::read_key(self.view, parent_offset)?;
                parent.subkey_count = parent.subkey_count.saturating_sub(1);
                write_key_at(self.view, parent_offset, &parent)?;
                return Ok(());
            }
        }

        let mut parent = index::read_key(self.view, parent_offset)?;
        let mut offsets = subkey_list::flatten(self.view, parent.subkey_list_offset)?;
        offsets.retain(|&o| o != child_offset);

        let old_list = parent.subkey_list_offset;
        let new_list = if offsets.is_empty() {
            INVALID_OFFSET
        } else {
            let entries = self.entries_for(&offsets)?;
            subkey_list::build(self.view, &mut self.alloc, &entries)?
        };
        if old_list != INVALID_OFFSET && self.strategy.should_free_vacated() {
            subkey_list::free_existing(self.view, &mut self.alloc, old_list)?;
        }

        parent.subkey_count = offsets.len() as u32;
        parent.subkey_list_offset = new_list;
        write_key_at(self.view, parent_offset, &parent)?;
        Ok(())
    }

    /// Occupancy stats for the hive currently backing this session.
    pub fn allocator_stats(&self) -> crate::allocator::AllocatorStats {
        self.alloc.stats(self.view)
    }
}

/// Lowercased, backslash-joined form of a path, used only to sort ops for
/// locality in the single-pass engine — never the wire format.
fn lower_path(segments: &[String]) -> String {
    segments.iter().map(|s| ascii_lower(s)).collect::<Vec<_>>().join("\\")
}

/// Builds the pruned-index prefilter (spec §4.5.2): for every prefix of
/// every op's path, maps the prefix's lowercased joined form to the set of
/// lowercased next-segment names worth descending into. The root's entry
/// key is `""`.
fn children_by_parent(plan: &Plan) -> HashMap<String, HashSet<String>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for op in &plan.ops {
        let segments = op.key_path();
        let mut prefix = String::new();
        for seg in segments {
            let lower = ascii_lower(seg);
            map.entry(prefix.clone()).or_default().insert(lower.clone());
            if !prefix.is_empty() {
                prefix.push('\\');
            }
            prefix.push_str(&lower);
        }
    }
    map
}

fn direct_find_child(view: &dyn HiveView, parent: u32, name: &str) -> Result<Option<u32>> {
    let parent_node = index::read_key(view, parent)?;
    if parent_node.subkey_list_offset == INVALID_OFFSET {
        return Ok(None);
    }
    let wanted = ascii_lower(name);
    for child_offset in subkey_list::flatten(view, parent_node.subkey_list_offset)? {
        let child = index::read_key(view, child_offset)?;
        if ascii_lower(&child.name) == wanted {
            return Ok(Some(child_offset));
        }
    }
    Ok(None)
}

fn direct_find_value(view: &dyn HiveView, key_offset: u32, name: &str) -> Result<Option<u32>> {
    let key = index::read_key(view, key_offset)?;
    if key.value_list_offset == INVALID_OFFSET {
        return Ok(None);
    }
    let wanted = ascii_lower(name);
    for vk_offset in index::read_value_list(view, key.value_list_offset, key.value_count)? {
        let vk = index::read_value(view, vk_offset)?;
        if ascii_lower(&vk.name) == wanted {
            return Ok(Some(vk_offset));
        }
    }
    Ok(None)
}

fn read_cell_payload_mut<'a>(view: &'a mut dyn HiveView, cell_offset: u32) -> Result<&'a mut [u8]> {
    let abs = cell_offset_to_absolute(cell_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    Ok(&mut view.as_bytes_mut()[(abs + 4) as usize..(abs + size) as usize])
}

fn read_cell_payload(view: &dyn HiveView, cell_offset: u32) -> Result<Vec<u8>> {
    let abs = cell_offset_to_absolute(cell_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    Ok(view.as_bytes()[(abs + 4) as usize..(abs + size) as usize].to_vec())
}

/// Frees a value's out-of-line data, routing through [`free_big_data`] when
/// `data_length` is beyond [`bigdata::MAX_DIRECT_VALUE_SIZE`] since a `db`
/// header cell, its segment list, and every segment each need freeing.
fn free_value_data(view: &mut dyn HiveView, alloc: &mut Allocator, data_offset: u32, data_length: u32) -> Result<()> {
    if data_length as usize > bigdata::MAX_DIRECT_VALUE_SIZE {
        free_big_data(view, alloc, data_offset)
    } else {
        alloc.free(view, data_offset, CellClass::Raw)
    }
}

fn free_big_data(view: &mut dyn HiveView, alloc: &mut Allocator, header_offset: u32) -> Result<()> {
    let header_payload = read_cell_payload(view, header_offset)?;
    let header = BigDataBlock::parse(&header_payload, header_offset)?;

    let list_payload = read_cell_payload(view, header.segment_list_offset)?;
    let mut segment_offsets = Vec::with_capacity(header.segment_count as usize);
    for i in 0..header.segment_count as usize {
        let pos = i * 4;
        if pos + 4 > list_payload.len() {
            break;
        }
        segment_offsets.push(read_u32_le(&list_payload, pos)?);
    }

    for seg_offset in segment_offsets {
        alloc.free(view, seg_offset, CellClass::Raw)?;
    }
    alloc.free(view, header.segment_list_offset, CellClass::Raw)?;
    alloc.free(view, header_offset, CellClass::Raw)?;
    Ok(())
}

/// Splits `payload` into segments, writes each as its own cell, builds the
/// segment offset list, and writes the `db` header referencing it. Returns
/// the header cell's offset, which a [`ValueKey`] stores as its data offset.
fn write_big_data(view: &mut dyn HiveView, alloc: &mut Allocator, payload: &[u8]) -> Result<u32> {
    let segments = bigdata::split_into_segments(payload);
    let mut segment_offsets = Vec::with_capacity(segments.len());
    for segment in &segments {
        let offset = alloc.alloc(view, segment.len() as u32, CellClass::Raw)?;
        write_payload_at(view, offset, segment)?;
        segment_offsets.push(offset);
    }

    let list_payload = bigdata::encode_segment_list(&segment_offsets);
    let list_offset = alloc.alloc(view, list_payload.len() as u32, CellClass::Raw)?;
    write_payload_at(view, list_offset, &list_payload)?;

    let header = BigDataBlock::new(segment_offsets.len() as u16, list_offset);
    let header_offset = alloc.alloc(view, BigDataBlock::encoded_len(), CellClass::Raw)?;
    header.write(read_cell_payload_mut(view, header_offset)?)?;
    Ok(header_offset)
}

fn write_key_at(view: &mut dyn HiveView, offset: u32, node: &KeyNode) -> Result<()> {
    node.write(read_cell_payload_mut(view, offset)?)
}

fn write_value_at(view: &mut dyn HiveView, offset: u32, vk: &ValueKey) -> Result<()> {
    vk.write(read_cell_payload_mut(view, offset)?)
}

fn write_payload_at(view: &mut dyn HiveView, offset: u32, payload: &[u8]) -> Result<()> {
    let buf = read_cell_payload_mut(view, offset)?;
    buf[..payload.len()].copy_from_slice(payload);
    Ok(())
}

/// Builds a value list cell: a flat array of little-endian VK cell offsets.
/// Returns `INVALID_OFFSET` for an empty list (no cell allocated).
fn build_value_list(view: &mut dyn HiveView, alloc: &mut Allocator, offsets: &[u32]) -> Result<u32> {
    if offsets.is_empty() {
        return Ok(INVALID_OFFSET);
    }
    let mut payload = vec![0u8; offsets.len() * 4];
    for (i, &offset) in offsets.iter().enumerate() {
        payload[i * 4..i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
    }
    let cell_offset = alloc.alloc(view, payload.len() as u32, CellClass::Raw)?;
    write_payload_at(view, cell_offset, &payload)?;
    Ok(cell_offset)
}
