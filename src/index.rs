//! Full-index lookup structures for the full-index apply engine (spec §5).
//!
//! Walking the whole tree once up front and hashing `(parent_ref,
//! lower_name) -> ref` trades memory for O(1) lookups on every subsequent
//! op; [`crate::session`] picks this engine when a plan has enough ops to
//! amortize the walk.

use crate::cell;
use crate::error::{RegistryError, Result};
use crate::key::KeyNode;
use crate::subkey_list;
use crate::utils::{ascii_lower, cell_offset_to_absolute, name_hint, INVALID_OFFSET};
use crate::value::ValueKey;
use crate::view::HiveView;
use std::collections::{HashMap, HashSet};
use tracing::instrument;

/// `(parent key cell offset, lowercased child name) -> child key cell offset`.
pub type KeyIndex = HashMap<(u32, String), u32>;

/// `(owning key cell offset, lowercased value name) -> value cell offset`.
pub type ValueIndex = HashMap<(u32, String), u32>;

/// Pre-built NK/VK lookup tables over an entire hive.
#[derive(Debug)]
pub struct HiveIndex {
    /// Maps a (parent, child name) pair to the child key node's offset.
    pub keys: KeyIndex,
    /// Maps a (key, value name) pair to the value key's offset.
    pub values: ValueIndex,
}

/// Estimated bytes per NK used to size the key index's initial capacity.
const BYTES_PER_NK_ESTIMATE: u64 = 300;

/// Values are assumed roughly 3x as numerous as keys in a typical hive.
const VALUES_PER_KEY_ESTIMATE: usize = 3;

/// Initial capacity hints for [`HiveIndex::build`]/[`HiveIndex::build_pruned`].
/// `0` means auto-estimate (spec §6.4 `nk_capacity`/`vk_capacity`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityHint {
    /// Initial key-map capacity, or `0` to estimate from hive size.
    pub nk: usize,
    /// Initial value-map capacity, or `0` to estimate from key count.
    pub vk: usize,
}

impl HiveIndex {
    /// Walks every key reachable from `root_offset`, indexing its children
    /// and values. Capacity is pre-sized from `hive_len` (or `capacity`,
    /// when given) so bulk-inserting during the walk doesn't repeatedly
    /// rehash. `cancel` is polled once per node visited, i.e. between tree
    /// levels (spec §5).
    #[instrument(skip(view, cancel))]
    pub fn build(
        view: &dyn HiveView,
        root_offset: u32,
        hive_len: u64,
        capacity: CapacityHint,
        cancel: &mut dyn FnMut() -> bool,
    ) -> Result<Self> {
        let estimated_keys = if capacity.nk > 0 {
            capacity.nk
        } else {
            (hive_len / BYTES_PER_NK_ESTIMATE).max(16) as usize
        };
        let estimated_values = if capacity.vk > 0 { capacity.vk } else { estimated_keys * VALUES_PER_KEY_ESTIMATE };
        let mut keys = HashMap::with_capacity(estimated_keys);
        let mut values = HashMap::with_capacity(estimated_values);

        let mut stack = vec![root_offset];
        while let Some(key_offset) = stack.pop() {
            if cancel() {
                return Err(RegistryError::Cancelled);
            }
            let node = read_key(view, key_offset)?;

            if node.value_list_offset != INVALID_OFFSET && node.value_count > 0 {
                for vk_offset in read_value_list(view, node.value_list_offset, node.value_count)? {
                    let vk = read_value(view, vk_offset)?;
                    values.insert((key_offset, ascii_lower(&vk.name)), vk_offset);
                }
            }

            if node.subkey_list_offset != INVALID_OFFSET && node.subkey_count > 0 {
                for child_offset in subkey_list::flatten(view, node.subkey_list_offset)? {
                    let child = read_key(view, child_offset)?;
                    keys.insert((key_offset, ascii_lower(&child.name)), child_offset);
                    stack.push(child_offset);
                }
            }
        }

        Ok(HiveIndex { keys, values })
    }

    /// Builds an index covering only the subtree a plan's ops touch (spec
    /// §4.5.2's pruned DFS): `children_by_parent` maps each visited node's
    /// lower-cased path to the set of lower-cased child names worth
    /// descending into. At each node, only children whose stored name hint
    /// (folded for case-insensitive comparison) could match a wanted name
    /// are decoded at all — siblings that can't possibly match are skipped
    /// without ever reading their key node. Values are indexed in full for
    /// every node actually visited, since there's no equivalent hint to
    /// prefilter on for value lookups.
    #[instrument(skip(view, children_by_parent, cancel))]
    pub fn build_pruned(
        view: &dyn HiveView,
        root_offset: u32,
        children_by_parent: &HashMap<String, HashSet<String>>,
        capacity: CapacityHint,
        cancel: &mut dyn FnMut() -> bool,
    ) -> Result<Self> {
        let default_cap = children_by_parent.len().max(16);
        let mut keys = HashMap::with_capacity(if capacity.nk > 0 { capacity.nk } else { default_cap });
        let mut values =
            HashMap::with_capacity(if capacity.vk > 0 { capacity.vk } else { default_cap * VALUES_PER_KEY_ESTIMATE });

        let mut stack = vec![(root_offset, String::new())];
        while let Some((key_offset, lower_path)) = stack.pop() {
            if cancel() {
                return Err(RegistryError::Cancelled);
            }
            let node = read_key(view, key_offset)?;

            if node.value_list_offset != INVALID_OFFSET && node.value_count > 0 {
                for vk_offset in read_value_list(view, node.value_list_offset, node.value_count)? {
                    let vk = read_value(view, vk_offset)?;
                    values.insert((key_offset, ascii_lower(&vk.name)), vk_offset);
                }
            }

            let Some(wanted) = children_by_parent.get(&lower_path) else {
                continue;
            };
            if node.subkey_list_offset == INVALID_OFFSET || node.subkey_count == 0 {
                continue;
            }

            let wanted_hints: HashSet<u32> = wanted.iter().map(|n| name_hint(n)).collect();
            for child_offset in subkey_list::flatten_by_hint(view, node.subkey_list_offset, &wanted_hints)? {
                let child = read_key(view, child_offset)?;
                let child_lower = ascii_lower(&child.name);
                if !wanted.contains(&child_lower) {
                    continue;
                }
                keys.insert((key_offset, child_lower.clone()), child_offset);

                let mut child_path = lower_path.clone();
                if !child_path.is_empty() {
                    child_path.push('\\');
                }
                child_path.push_str(&child_lower);
                stack.push((child_offset, child_path));
            }
        }

        Ok(HiveIndex { keys, values })
    }

    /// Looks up a direct child of `parent_offset` by name (case-insensitive).
    pub fn find_key(&self, parent_offset: u32, name: &str) -> Option<u32> {
        self.keys.get(&(parent_offset, ascii_lower(name))).copied()
    }

    /// Looks up a value owned by `key_offset` by name (case-insensitive).
    pub fn find_value(&self, key_offset: u32, name: &str) -> Option<u32> {
        self.values.get(&(key_offset, ascii_lower(name))).copied()
    }

    /// Records a newly created child key so later ops in the same session
    /// see it without a re-scan.
    pub fn insert_key(&mut self, parent_offset: u32, name: &str, child_offset: u32) {
        self.keys.insert((parent_offset, ascii_lower(name)), child_offset);
    }

    /// Removes a child key from the index (after a delete).
    pub fn remove_key(&mut self, parent_offset: u32, name: &str) {
        self.keys.remove(&(parent_offset, ascii_lower(name)));
    }

    /// Records a newly created or updated value.
    pub fn insert_value(&mut self, key_offset: u32, name: &str, value_offset: u32) {
        self.values.insert((key_offset, ascii_lower(name)), value_offset);
    }

    /// Removes a value from the index (after a delete).
    pub fn remove_value(&mut self, key_offset: u32, name: &str) {
        self.values.remove(&(key_offset, ascii_lower(name)));
    }
}

pub(crate) fn read_key(view: &dyn HiveView, key_offset: u32) -> Result<KeyNode> {
    let abs = cell_offset_to_absolute(key_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    let payload = &view.as_bytes()[(abs + 4) as usize..(abs + size) as usize];
    KeyNode::parse(payload, key_offset)
}

pub(crate) fn read_value(view: &dyn HiveView, value_offset: u32) -> Result<ValueKey> {
    let abs = cell_offset_to_absolute(value_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    let payload = &view.as_bytes()[(abs + 4) as usize..(abs + size) as usize];
    ValueKey::parse(payload, value_offset)
}

pub(crate) fn read_value_list(view: &dyn HiveView, list_offset: u32, count: u32) -> Result<Vec<u32>> {
    let abs = cell_offset_to_absolute(list_offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    let payload = &view.as_bytes()[(abs + 4) as usize..(abs + size) as usize];
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let pos = i * 4;
        if pos + 4 > payload.len() {
            break;
        }
        out.push(crate::utils::read_u32_le(payload, pos)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocOptions, Allocator};
    use crate::cell::CellClass;
    use crate::hbin::HbinHeader;
    use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
    use crate::utils::HBIN_START_OFFSET;
    use crate::view::MemView;

    fn fresh_hive() -> (MemView, Allocator, u32) {
        let mut data = vec![0u8; BASE_BLOCK_SIZE + 0x100000];
        let root = KeyNode::new("ROOT", INVALID_OFFSET, true);
        let root_len = root.encoded_len();
        BaseBlock::format_new(&mut data, 0, 0x100000).unwrap();
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

        (view, alloc, root_offset)
    }

    #[test]
    fn test_build_index_on_empty_root() {
        let (view, _alloc, root_offset) = fresh_hive();
        let index =
            HiveIndex::build(&view, root_offset, view.len() as u64, CapacityHint::default(), &mut || false).unwrap();
        assert!(index.keys.is_empty());
        assert!(index.values.is_empty());
    }

    #[test]
    fn test_insert_and_find_key() {
        let (view, _alloc, root_offset) = fresh_hive();
        let mut index =
            HiveIndex::build(&view, root_offset, view.len() as u64, CapacityHint::default(), &mut || false).unwrap();
        index.insert_key(root_offset, "Software", 0x40);
        assert_eq!(index.find_key(root_offset, "software"), Some(0x40));
        index.remove_key(root_offset, "SOFTWARE");
        assert_eq!(index.find_key(root_offset, "software"), None);
    }

    #[test]
    fn test_build_respects_cancellation() {
        let (view, _alloc, root_offset) = fresh_hive();
        let mut calls = 0;
        let err = HiveIndex::build(&view, root_offset, view.len() as u64, CapacityHint::default(), &mut || {
            calls += 1;
            true
        })
        .unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_build_pruned_skips_unwanted_siblings() {
        let (mut view, mut alloc, root_offset) = fresh_hive();

        let mut wanted_offsets = Vec::new();
        let mut entries = Vec::new();
        for name in ["Alpha", "Beta", "Gamma"] {
            let node = KeyNode::new(name, root_offset, false);
            let offset = alloc.alloc(&mut view, node.encoded_len(), cell::CellClass::Nk).unwrap();
            let abs = cell_offset_to_absolute(offset).unwrap();
            let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
            node.write(&mut view.as_bytes_mut()[(abs + 4) as usize..(abs + size) as usize]).unwrap();
            if name == "Beta" {
                wanted_offsets.push(offset);
            }
            entries.push(crate::subkey_list::SubkeyListEntry { key_offset: offset, name_hint: name_hint(name) });
        }
        let list_offset = crate::subkey_list::build(&mut view, &mut alloc, &entries).unwrap();
        let mut root = read_key(&view, root_offset).unwrap();
        root.subkey_count = entries.len() as u32;
        root.subkey_list_offset = list_offset;
        let abs = cell_offset_to_absolute(root_offset).unwrap();
        let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
        root.write(&mut view.as_bytes_mut()[(abs + 4) as usize..(abs + size) as usize]).unwrap();

        let mut wanted = HashMap::new();
        wanted.insert(String::new(), HashSet::from(["beta".to_string()]));

        let index =
            HiveIndex::build_pruned(&view, root_offset, &wanted, CapacityHint::default(), &mut || false).unwrap();
        assert_eq!(index.find_key(root_offset, "beta"), Some(wanted_offsets[0]));
        assert_eq!(index.find_key(root_offset, "alpha"), None);
        assert_eq!(index.find_key(root_offset, "gamma"), None);
    }
}
