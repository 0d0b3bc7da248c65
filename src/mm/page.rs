//! Supplemental page table.
//!
//! The per-process record of how to materialize each virtual page on
//! demand. Entries are installed when an executable's segments are mapped
//! lazily at load, when a file is memory-mapped, and when the stack grows;
//! they are updated as pages travel to and from swap. For every user
//! virtual page exactly one of four states holds: resident in the page
//! directory, out in swap (`swapped` set), unmaterialized (an entry but no
//! frame), or absent (no entry).

use crate::{fs::file::File, sync::SpinLock};
use std::{collections::BTreeMap, sync::Arc};

/// How to materialize one virtual page.
#[derive(Clone)]
pub struct SuppPage {
    /// Backing file for a lazily loaded or memory-mapped page.
    pub file: Option<Arc<File>>,
    /// Byte offset of the page's contents within the file.
    pub offset: usize,
    /// Bytes to read from the file; the rest of the page is zeroed.
    pub read_bytes: usize,
    /// Bytes to zero after the read portion.
    pub zero_bytes: usize,
    /// Whether the page is mapped writable.
    pub writable: bool,
    /// Whether the page belongs to a memory mapping.
    pub mmaped: bool,
    /// Whether the page currently lives in swap.
    pub swapped: bool,
    /// Swap slot holding the page while `swapped` is set.
    pub swap_slot: usize,
}

impl SuppPage {
    /// An all-zero, writable, anonymous page. Stack pages use this shape.
    pub fn zeroed() -> Self {
        Self {
            file: None,
            offset: 0,
            read_bytes: 0,
            zero_bytes: super::PAGE_SIZE,
            writable: true,
            mmaped: false,
            swapped: false,
            swap_slot: 0,
        }
    }

    /// A page filled from `file` at `offset`.
    pub fn from_file(
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        writable: bool,
        mmaped: bool,
    ) -> Self {
        Self {
            file: Some(file),
            offset,
            read_bytes,
            zero_bytes: super::PAGE_SIZE - read_bytes,
            writable,
            mmaped,
            swapped: false,
            swap_slot: 0,
        }
    }
}

/// The supplemental page table, keyed by virtual page base.
pub struct SuppTable {
    inner: SpinLock<BTreeMap<usize, SuppPage>>,
}

impl Default for SuppTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SuppTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Install (or replace) the entry for the page at `base`.
    pub fn insert(&self, base: usize, page: SuppPage) {
        let mut inner = self.inner.lock();
        inner.insert(base, page);
        inner.unlock();
    }

    /// Copy out the entry for the page at `base`.
    pub fn get(&self, base: usize) -> Option<SuppPage> {
        let inner = self.inner.lock();
        let page = inner.get(&base).cloned();
        inner.unlock();
        page
    }

    /// Whether the page at `base` has an entry.
    pub fn contains(&self, base: usize) -> bool {
        let inner = self.inner.lock();
        let present = inner.contains_key(&base);
        inner.unlock();
        present
    }

    /// Drop the entry for the page at `base`.
    pub fn remove(&self, base: usize) -> Option<SuppPage> {
        let mut inner = self.inner.lock();
        let page = inner.remove(&base);
        inner.unlock();
        page
    }

    /// Record that the page at `base` went out to swap slot `slot`.
    pub fn set_swapped(&self, base: usize, slot: usize) {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(&base).expect("evicted page has no entry");
        entry.swapped = true;
        entry.swap_slot = slot;
        inner.unlock();
    }

    /// Record that the page at `base` came back from swap.
    pub fn clear_swapped(&self, base: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&base) {
            entry.swapped = false;
            entry.swap_slot = 0;
        }
        inner.unlock();
    }

    /// Drain every entry, for process teardown.
    pub fn take_all(&self) -> Vec<(usize, SuppPage)> {
        let mut inner = self.inner.lock();
        let all = core::mem::take(&mut *inner).into_iter().collect();
        inner.unlock();
        all
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let n = inner.len();
        inner.unlock();
        n
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
