//! Memory-mapped files.
//!
//! `mmap` binds a file's bytes to a page-aligned range of the process
//! address space. No byte is read at map time: one supplemental entry per
//! page defers the I/O to the first fault, exactly like a lazily loaded
//! segment, but flagged as a mapping so eviction and unmap write dirty
//! pages back to the file instead of to swap.

use super::Process;
use crate::{
    fs::file::File,
    kernel::Kernel,
    mm::{page::SuppPage, Va, PAGE_SIZE, PHYS_BASE},
    KernelError,
};
use std::sync::Arc;

/// One live mapping.
pub(crate) struct Mmap {
    pub mid: i32,
    pub base: Va,
    pub length: usize,
    pub file: Arc<File>,
}

impl Mmap {
    fn pages(&self) -> usize {
        self.length.div_ceil(PAGE_SIZE)
    }
}

/// The per-process table of mappings.
pub(crate) struct MmapTable {
    next_mid: i32,
    list: Vec<Mmap>,
}

impl MmapTable {
    pub(crate) fn new() -> Self {
        Self {
            next_mid: 0,
            list: Vec::new(),
        }
    }
}

/// Map `file` at `addr`, returning the mapping id.
pub(crate) fn mmap(process: &Arc<Process>, file: &File, addr: Va) -> Result<i32, KernelError> {
    let length = file.length();
    if addr.0 == 0 || !addr.is_page_aligned() || length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pages = length.div_ceil(PAGE_SIZE);
    let Some(end) = addr.0.checked_add(pages * PAGE_SIZE) else {
        return Err(KernelError::InvalidArgument);
    };
    if !addr.is_user() || end > PHYS_BASE {
        return Err(KernelError::InvalidArgument);
    }
    // Every page of the range must be unused.
    for i in 0..pages {
        let page = addr.0 + i * PAGE_SIZE;
        if process.supp.contains(page) || process.pagedir.is_present(Va(page)) {
            return Err(KernelError::InvalidArgument);
        }
    }
    // An independent handle keeps the mapping alive past a close(fd).
    let handle = Arc::new(file.reopen());
    for i in 0..pages {
        let offset = i * PAGE_SIZE;
        let read_bytes = (length - offset).min(PAGE_SIZE);
        process.supp.insert(
            addr.0 + offset,
            SuppPage::from_file(handle.clone(), offset, read_bytes, true, true),
        );
    }
    let mut mmaps = process.mmaps.lock();
    let mid = mmaps.next_mid;
    mmaps.next_mid += 1;
    mmaps.list.push(Mmap {
        mid,
        base: addr,
        length,
        file: handle,
    });
    mmaps.unlock();
    Ok(mid)
}

/// Tear down mapping `mid`, writing dirty resident pages back to the file.
pub(crate) fn munmap(kernel: &Arc<Kernel>, process: &Arc<Process>, mid: i32) -> Result<(), KernelError> {
    let mapping = {
        let mut mmaps = process.mmaps.lock();
        let at = mmaps.list.iter().position(|m| m.mid == mid);
        let mapping = at.map(|i| mmaps.list.remove(i));
        mmaps.unlock();
        mapping.ok_or(KernelError::InvalidArgument)?
    };
    for i in 0..mapping.pages() {
        let page = Va(mapping.base.0 + i * PAGE_SIZE);
        let offset = i * PAGE_SIZE;
        let read_bytes = (mapping.length - offset).min(PAGE_SIZE);
        if process.pagedir.is_present(page) {
            if process.pagedir.is_dirty(page) {
                let wrote = process
                    .pagedir
                    .with_frame(page, |data| {
                        mapping.file.write_at(&data[..read_bytes], offset)
                    })
                    .unwrap_or(0);
                if wrote != read_bytes {
                    return Err(KernelError::IOError);
                }
            }
            kernel.frames().delete_one(&process.pagedir, page);
            drop(process.pagedir.clear_page(page));
        }
        if let Some(entry) = process.supp.remove(page.0) {
            if entry.swapped {
                kernel.swap().set(entry.swap_slot, false);
            }
        }
    }
    // Dropping the handle closes the file.
    drop(mapping);
    Ok(())
}

/// Tear down every mapping; used at process exit.
pub(crate) fn munmap_all(kernel: &Arc<Kernel>, process: &Arc<Process>) {
    loop {
        let mid = {
            let mmaps = process.mmaps.lock();
            let mid = mmaps.list.first().map(|m| m.mid);
            mmaps.unlock();
            mid
        };
        let Some(mid) = mid else {
            break;
        };
        let _ = munmap(kernel, process, mid);
    }
}
