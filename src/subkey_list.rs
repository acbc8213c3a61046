//! Subkey list parsing and mutation (lf, lh, li, ri).
//!
//! Subkeys are indexed through one of four cell layouts: `li` (a flat
//! offset array), `lf`/`lh` (a flat array with a 4-byte hint per entry,
//! used for faster client-side comparisons), and `ri` (an index of `lf`/
//! `lh` sublists, used once a key has more subkeys than fit comfortably in
//! one cell). This engine always *writes* `lh` leaves — `lf`/`lh` share a
//! byte layout and the distinction carries no semantic weight here — but
//! still reads all four for compatibility with hives written elsewhere.

use crate::allocator::Allocator;
use crate::cell::{self, CellClass};
use crate::error::{RegistryError, Result};
use crate::utils::{absolute_to_cell_offset, cell_offset_to_absolute, read_u32_le, INVALID_OFFSET};
use crate::view::HiveView;

/// Above this many entries, a subkey list is split into `lh` chunks under
/// one `ri` index rather than kept as a single flat cell. Chosen so a
/// single leaf cell stays comfortably under one hbin's default growth
/// chunk even for very long names; real hives use a similar order of
/// magnitude.
pub const MAX_DIRECT_ENTRIES: usize = 512;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,
    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,
    /// Hash leaf (lh) - list with name hash hints.
    HashLeaf,
    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone, Copy)]
pub struct SubkeyListEntry {
    /// Offset to the key node.
    pub key_offset: u32,
    /// Name hint (first 4 chars for lf, hash for lh).
    pub name_hint: u32,
}

/// Parsed subkey list.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),
    /// Fast leaf or hash leaf - list with hints.
    LeafWithHints(Vec<SubkeyListEntry>),
    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data (payload, excluding size field).
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        match list_type {
            SubkeyListType::IndexLeaf => {
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }
                Ok(SubkeyList::IndexLeaf(offsets))
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                let expected_size = 4 + (count * 8);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + (i * 8);
                    entries.push(SubkeyListEntry {
                        key_offset: read_u32_le(data, entry_pos)?,
                        name_hint: read_u32_le(data, entry_pos + 4)?,
                    });
                }
                Ok(SubkeyList::LeafWithHints(entries))
            }

            SubkeyListType::IndexRoot => {
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }
                Ok(SubkeyList::IndexRoot(offsets))
            }
        }
    }

    /// Returns an iterator over key offsets, regardless of list shape.
    pub fn key_offsets_iter(&self) -> impl Iterator<Item = u32> + '_ {
        match self {
            SubkeyList::IndexLeaf(offsets) => {
                Box::new(offsets.iter().copied()) as Box<dyn Iterator<Item = u32> + '_>
            }
            SubkeyList::LeafWithHints(entries) => Box::new(entries.iter().map(|e| e.key_offset)),
            SubkeyList::IndexRoot(offsets) => Box::new(offsets.iter().copied()),
        }
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }
}

/// Encodes a flat `lh` leaf cell payload from `entries`.
pub fn encode_leaf(entries: &[SubkeyListEntry]) -> Vec<u8> {
    let mut out = vec![0u8; 4 + entries.len() * 8];
    out[0..2].copy_from_slice(b"lh");
    out[2..4].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    for (i, entry) in entries.iter().enumerate() {
        let pos = 4 + i * 8;
        out[pos..pos + 4].copy_from_slice(&entry.key_offset.to_le_bytes());
        out[pos + 4..pos + 8].copy_from_slice(&entry.name_hint.to_le_bytes());
    }
    out
}

/// Encodes an `ri` index-root cell payload from sublist offsets.
pub fn encode_index_root(sublist_offsets: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; 4 + sublist_offsets.len() * 4];
    out[0..2].copy_from_slice(b"ri");
    out[2..4].copy_from_slice(&(sublist_offsets.len() as u16).to_le_bytes());
    for (i, &offset) in sublist_offsets.iter().enumerate() {
        let pos = 4 + i * 4;
        out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
    }
    out
}

/// Rebuilds the subkey list structure for `entries` — the caller must
/// already have them sorted by lowercased name, matching the order a
/// client doing binary search over hints would expect — allocating
/// whatever cells are needed and returning the offset to store in the
/// parent NK's `subkey_list_offset`. Returns `INVALID_OFFSET` when
/// `entries` is empty (no list cell is allocated for zero subkeys).
pub fn build(
    view: &mut dyn HiveView,
    alloc: &mut Allocator,
    entries: &[SubkeyListEntry],
) -> Result<u32> {
    if entries.is_empty() {
        return Ok(INVALID_OFFSET);
    }

    if entries.len() <= MAX_DIRECT_ENTRIES {
        return write_cell(view, alloc, &encode_leaf(entries), CellClass::Lf);
    }

    let mut sublist_offsets = Vec::with_capacity(entries.len() / MAX_DIRECT_ENTRIES + 1);
    for chunk in entries.chunks(MAX_DIRECT_ENTRIES) {
        sublist_offsets.push(write_cell(view, alloc, &encode_leaf(chunk), CellClass::Lf)?);
    }
    write_cell(view, alloc, &encode_index_root(&sublist_offsets), CellClass::Ri)
}

/// Frees every cell belonging to the subkey list rooted at `list_offset`
/// (the leaf cells and, for an `ri` root, the root cell itself). Never
/// frees the key nodes the list's entries point to. No-op for
/// `INVALID_OFFSET`.
pub fn free_existing(view: &mut dyn HiveView, alloc: &mut Allocator, list_offset: u32) -> Result<()> {
    if list_offset == INVALID_OFFSET {
        return Ok(());
    }

    let list = read_list(view, list_offset)?;
    if let SubkeyList::IndexRoot(sublists) = &list {
        for &sublist_offset in sublists {
            alloc.free(view, sublist_offset, CellClass::Lf)?;
        }
        alloc.free(view, list_offset, CellClass::Ri)?;
    } else {
        alloc.free(view, list_offset, CellClass::Lf)?;
    }
    Ok(())
}

/// Reads and parses the subkey list at `list_offset`.
pub fn read_list(view: &dyn HiveView, list_offset: u32) -> Result<SubkeyList> {
    let abs = cell_offset_to_absolute(list_offset)?;
    let (size, is_allocated) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    if !is_allocated {
        return Err(RegistryError::InvalidFormat(format!(
            "subkey list cell at {:#x} is not allocated",
            list_offset
        )));
    }
    let payload = &view.as_bytes()[(abs + 4) as usize..(abs + size) as usize];
    SubkeyList::parse(payload, list_offset)
}

/// Flattens a (possibly two-level) subkey list into key offsets.
pub fn flatten(view: &dyn HiveView, list_offset: u32) -> Result<Vec<u32>> {
    if list_offset == INVALID_OFFSET {
        return Ok(Vec::new());
    }
    let list = read_list(view, list_offset)?;
    match list {
        SubkeyList::IndexRoot(sublists) => {
            let mut out = Vec::new();
            for sublist_offset in sublists {
                let sub = read_list(view, sublist_offset)?;
                out.extend(sub.key_offsets_iter());
            }
            Ok(out)
        }
        other => Ok(other.key_offsets_iter().collect()),
    }
}

/// Flattens a subkey list like [`flatten`], but for leaf entries that carry
/// a name hint, skips any entry whose folded hint isn't in `wanted_hints` —
/// the single-pass engine's pruned walk (spec §4.3/§4.5.2) uses this to
/// avoid decoding every sibling's NK just to read its name. Entries from a
/// hint-less `li` list are all returned, since there's no cheap prefilter
/// available for that shape.
pub fn flatten_by_hint(
    view: &dyn HiveView,
    list_offset: u32,
    wanted_hints: &std::collections::HashSet<u32>,
) -> Result<Vec<u32>> {
    if list_offset == INVALID_OFFSET {
        return Ok(Vec::new());
    }
    let list = read_list(view, list_offset)?;
    match list {
        SubkeyList::IndexRoot(sublists) => {
            let mut out = Vec::new();
            for sublist_offset in sublists {
                out.extend(flatten_by_hint(view, sublist_offset, wanted_hints)?);
            }
            Ok(out)
        }
        SubkeyList::LeafWithHints(entries) => Ok(entries
            .into_iter()
            .filter(|e| wanted_hints.contains(&crate::utils::fold_hint(e.name_hint)))
            .map(|e| e.key_offset)
            .collect()),
        SubkeyList::IndexLeaf(offsets) => Ok(offsets),
    }
}

fn write_cell(view: &mut dyn HiveView, alloc: &mut Allocator, payload: &[u8], class: CellClass) -> Result<u32> {
    let offset = alloc.alloc(view, payload.len() as u32, class)?;
    let abs = cell_offset_to_absolute(offset)?;
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize)?;
    let start = (abs + 4) as usize;
    view.as_bytes_mut()[start..start + payload.len()].copy_from_slice(payload);
    debug_assert!(size as usize >= payload.len() + 4);
    let _ = absolute_to_cell_offset(abs)?;
    Ok(offset)
}
