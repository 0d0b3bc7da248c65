//! Frame table.
//!
//! One record per resident user page across all processes. Victims are
//! chosen with a second-chance clock over the queue: a popped record whose
//! page has the accessed bit set loses the bit and goes to the back; one
//! whose page carries the current-stack mark loses the mark and goes to
//! the back; the first cold record becomes the victim. The table holds no
//! frame memory itself, only the coordinates of each resident page.

use super::{pagedir::PageDir, Va};
use crate::{proc::Process, sync::SpinLock};
use std::{collections::VecDeque, sync::Arc};

/// Coordinates of one resident user page.
pub struct FrameRec {
    /// Page directory the page is installed in.
    pub pd: Arc<PageDir>,
    /// Virtual page base.
    pub va: Va,
    /// Owning process, whose supplemental table records the eviction.
    pub process: Arc<Process>,
}

/// The global table of resident user pages.
pub struct FrameTable {
    inner: SpinLock<VecDeque<FrameRec>>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(VecDeque::new()),
        }
    }

    /// Record a freshly resident page.
    pub fn push(&self, rec: FrameRec) {
        let mut inner = self.inner.lock();
        inner.push_back(rec);
        inner.unlock();
    }

    /// Choose and remove a victim with the clock sweep. Returns `None`
    /// when no page is resident.
    pub fn find_victim(&self) -> Option<FrameRec> {
        let mut inner = self.inner.lock();
        let mut sweeps = 0usize;
        let limit = inner.len().saturating_mul(2) + 1;
        let victim = loop {
            let Some(rec) = inner.pop_front() else {
                break None;
            };
            // After two full sweeps every second chance has been spent.
            if sweeps > limit {
                break Some(rec);
            }
            sweeps += 1;
            if rec.pd.is_accessed(rec.va) {
                rec.pd.set_accessed(rec.va, false);
                inner.push_back(rec);
            } else if rec.pd.take_stack_mark(rec.va) {
                inner.push_back(rec);
            } else {
                break Some(rec);
            }
        };
        inner.unlock();
        victim
    }

    /// Drop every record belonging to `pd`. Called on process exit; the
    /// frames themselves are freed when the page directory is destroyed.
    pub fn delete_all_for(&self, pd: &Arc<PageDir>) {
        let mut inner = self.inner.lock();
        inner.retain(|rec| !Arc::ptr_eq(&rec.pd, pd));
        inner.unlock();
    }

    /// Drop the record for one page of `pd`, if present.
    pub fn delete_one(&self, pd: &Arc<PageDir>, va: Va) {
        let mut inner = self.inner.lock();
        inner.retain(|rec| !(Arc::ptr_eq(&rec.pd, pd) && rec.va == va));
        inner.unlock();
    }

    /// Number of resident pages recorded.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let n = inner.len();
        inner.unlock();
        n
    }

    /// Whether no page is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
