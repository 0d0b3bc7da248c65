//! Page directory.
//!
//! The per-process mapping from virtual page bases to resident frames,
//! with the writable, accessed and dirty bits the hardware would keep.
//! Byte accesses through [`PageDir::read`] and [`PageDir::write`] set the
//! accessed and dirty bits the way a memory access would; the eviction
//! clock reads and clears the accessed bit, and mmap write-back consults
//! the dirty bit.
//!
//! A page may additionally carry a *stack mark*, set when the recorded
//! user stack pointer lands on it. The eviction clock gives marked pages
//! a second chance just like accessed ones, consuming the mark. The mark
//! is deliberately separate from the dirty bit, which keeps its only
//! meaning of "memory differs from backing store".

use super::{Frame, Va, PAGE_SIZE};
use crate::sync::SpinLock;
use std::collections::BTreeMap;

pub(crate) struct PdEntry {
    frame: Frame,
    writable: bool,
    accessed: bool,
    dirty: bool,
    stack_mark: bool,
}

/// Outcome of a byte-level write through the directory.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bytes were stored.
    Done,
    /// No frame is mapped at the page.
    NotPresent,
    /// The page is mapped read-only.
    ReadOnly,
}

/// A simulated page directory.
pub struct PageDir {
    inner: SpinLock<BTreeMap<usize, PdEntry>>,
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Install `frame` at page `va`. Fails, handing the frame back, when
    /// the page is already mapped.
    pub fn set_page(&self, va: Va, frame: Frame, writable: bool) -> Result<(), Frame> {
        debug_assert!(va.is_page_aligned());
        let mut inner = self.inner.lock();
        if inner.contains_key(&va.0) {
            inner.unlock();
            return Err(frame);
        }
        inner.insert(
            va.0,
            PdEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
                stack_mark: false,
            },
        );
        inner.unlock();
        Ok(())
    }

    /// Unmap page `va`, returning its frame.
    pub fn clear_page(&self, va: Va) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let entry = inner.remove(&va.0);
        inner.unlock();
        entry.map(|e| e.frame)
    }

    /// Whether page `va` is resident.
    pub fn is_present(&self, va: Va) -> bool {
        let inner = self.inner.lock();
        let present = inner.contains_key(&va.page_base().0);
        inner.unlock();
        present
    }

    /// Number of resident pages.
    pub fn resident_count(&self) -> usize {
        let inner = self.inner.lock();
        let n = inner.len();
        inner.unlock();
        n
    }

    fn with_entry<R>(&self, va: Va, f: impl FnOnce(&mut PdEntry) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let r = inner.get_mut(&va.page_base().0).map(f);
        inner.unlock();
        r
    }

    /// The accessed bit of page `va`.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.with_entry(va, |e| e.accessed).unwrap_or(false)
    }

    /// Set or clear the accessed bit of page `va`.
    pub fn set_accessed(&self, va: Va, accessed: bool) {
        self.with_entry(va, |e| e.accessed = accessed);
    }

    /// The dirty bit of page `va`.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.with_entry(va, |e| e.dirty).unwrap_or(false)
    }

    /// Set or clear the dirty bit of page `va`.
    pub fn set_dirty(&self, va: Va, dirty: bool) {
        self.with_entry(va, |e| e.dirty = dirty);
    }

    /// Mark page `va` as the current stack page.
    pub fn set_stack_mark(&self, va: Va) {
        self.with_entry(va, |e| e.stack_mark = true);
    }

    /// Consume the stack mark of page `va`, returning whether it was set.
    pub fn take_stack_mark(&self, va: Va) -> bool {
        self.with_entry(va, |e| core::mem::replace(&mut e.stack_mark, false)).unwrap_or(false)
    }

    /// Whether page `va` is mapped writable.
    pub fn is_writable(&self, va: Va) -> bool {
        self.with_entry(va, |e| e.writable).unwrap_or(false)
    }

    /// Copy bytes out of page `va`, setting the accessed bit. `va` and the
    /// read must stay within one page. Returns false when the page is not
    /// resident.
    pub fn read(&self, va: Va, buf: &mut [u8]) -> bool {
        let ofs = va.page_offset();
        debug_assert!(ofs + buf.len() <= PAGE_SIZE);
        self.with_entry(va, |e| {
            e.accessed = true;
            buf.copy_from_slice(&e.frame.data[ofs..ofs + buf.len()]);
        })
        .is_some()
    }

    /// Copy bytes into page `va`, setting the accessed and dirty bits.
    /// `va` and the write must stay within one page.
    pub fn write(&self, va: Va, buf: &[u8]) -> WriteOutcome {
        let ofs = va.page_offset();
        debug_assert!(ofs + buf.len() <= PAGE_SIZE);
        self.with_entry(va, |e| {
            if !e.writable {
                return WriteOutcome::ReadOnly;
            }
            e.accessed = true;
            e.dirty = true;
            e.frame.data[ofs..ofs + buf.len()].copy_from_slice(buf);
            WriteOutcome::Done
        })
        .unwrap_or(WriteOutcome::NotPresent)
    }

    /// Run `f` over the raw frame bytes of page `va` without touching the
    /// accessed or dirty bits. The eviction and write-back paths use this.
    pub fn with_frame<R>(&self, va: Va, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> Option<R> {
        self.with_entry(va, |e| f(&mut e.frame.data))
    }

    /// Drop every mapping, returning the frames to the pool.
    pub fn destroy(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.len();
        inner.clear();
        inner.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::UserPool;

    #[test]
    fn map_access_bits() {
        let pool = UserPool::new(4);
        let pd = PageDir::new();
        let va = Va(0x8000_0000);
        pd.set_page(va, pool.try_alloc().unwrap(), true).unwrap();
        assert!(!pd.is_accessed(va));
        assert_eq!(pd.write(va + 16, b"zz"), WriteOutcome::Done);
        assert!(pd.is_accessed(va) && pd.is_dirty(va));
        let mut out = [0u8; 2];
        assert!(pd.read(va + 16, &mut out));
        assert_eq!(&out, b"zz");
        // Double map is refused and the frame comes back.
        let f = pool.try_alloc().unwrap();
        assert!(pd.set_page(va, f, true).is_err());
        assert_eq!(pool.available(), 3);
        // Read-only page refuses writes.
        let ro = Va(0x8000_2000);
        pd.set_page(ro, pool.try_alloc().unwrap(), false).unwrap();
        assert_eq!(pd.write(ro, b"x"), WriteOutcome::ReadOnly);
        pd.destroy();
        assert_eq!(pool.available(), 4);
    }
}
