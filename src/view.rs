//! Growable, mutable backing storage for a hive being edited.
//!
//! The merge engine never holds a borrowed slice across a call that can
//! grow the backing store: growth may remap the file (a fresh `mmap`), which
//! invalidates any `&[u8]`/`&mut [u8]` taken from the old mapping. Callers
//! re-borrow via [`HiveView::as_bytes`] / [`HiveView::as_bytes_mut`] after
//! every [`HiveView::grow`].

use crate::error::{RegistryError, Result};
use memmap2::MmapMut;
use std::fs::File;
use std::io::Write as _;
use tracing::instrument;

/// A resizable, byte-addressable view onto hive storage.
pub trait HiveView {
    /// Current length of the view in bytes.
    fn len(&self) -> u32;

    /// True if the view is empty (never true for an opened hive).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the whole buffer immutably.
    fn as_bytes(&self) -> &[u8];

    /// Borrows the whole buffer mutably.
    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Grows the view to at least `new_len` bytes, zero-filling the new
    /// region. No-op if `new_len <= self.len()`.
    fn grow(&mut self, new_len: u32) -> Result<()>;

    /// Flushes dirty pages to the backing medium. For an in-memory view
    /// this is a no-op.
    fn flush(&mut self) -> Result<()>;

    /// Hints the OS about expected access patterns (spec §6.4
    /// `huge_pages`/`willneed_hint`). Best-effort: a view with no real OS
    /// mapping behind it (e.g. [`MemView`]) just ignores the hint.
    fn advise(&mut self, _huge_pages: bool, _willneed: bool) -> Result<()> {
        Ok(())
    }
}

/// A hive view backed by a memory-mapped file, growable by truncating and
/// remapping the file.
pub struct MappedView {
    file: File,
    mmap: MmapMut,
}

impl MappedView {
    /// Opens an existing file for read-write mapping.
    pub fn open(file: File) -> Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MappedView { file, mmap })
    }

    /// Creates a new file of `initial_len` bytes and maps it.
    pub fn create(mut file: File, initial_len: u32) -> Result<Self> {
        file.set_len(u64::from(initial_len))?;
        file.flush()?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MappedView { file, mmap })
    }
}

impl HiveView for MappedView {
    fn len(&self) -> u32 {
        self.mmap.len() as u32
    }

    fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    #[instrument(skip(self))]
    fn grow(&mut self, new_len: u32) -> Result<()> {
        if new_len <= self.len() {
            return Ok(());
        }
        self.mmap.flush()?;
        self.file.set_len(u64::from(new_len))?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.mmap.flush().map_err(RegistryError::from)
    }

    #[cfg(unix)]
    fn advise(&mut self, huge_pages: bool, willneed: bool) -> Result<()> {
        use memmap2::Advice;
        if willneed {
            self.mmap.advise(Advice::WillNeed)?;
        }
        if huge_pages {
            // Best-effort: not every kernel has transparent huge pages
            // enabled, so a failure here isn't fatal to the session.
            let _ = self.mmap.advise(Advice::HugePage);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn advise(&mut self, _huge_pages: bool, _willneed: bool) -> Result<()> {
        Ok(())
    }
}

/// An in-memory hive view, used by tests and by callers who want to build a
/// hive entirely in memory before writing it out in one shot.
#[derive(Debug, Default, Clone)]
pub struct MemView {
    data: Vec<u8>,
}

impl MemView {
    /// Creates a view over an existing byte buffer.
    pub fn new(data: Vec<u8>) -> Self {
        MemView { data }
    }

    /// Consumes the view, returning the underlying buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl HiveView for MemView {
    fn len(&self) -> u32 {
        self.data.len() as u32
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn grow(&mut self, new_len: u32) -> Result<()> {
        if new_len as usize > self.data.len() {
            self.data.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_view_grows_zero_filled() {
        let mut view = MemView::new(vec![1, 2, 3]);
        view.grow(8).unwrap();
        assert_eq!(view.as_bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mem_view_grow_shrink_noop() {
        let mut view = MemView::new(vec![1, 2, 3, 4]);
        view.grow(2).unwrap();
        assert_eq!(view.len(), 4);
    }
}
