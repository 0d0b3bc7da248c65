//! Page-fault handler.
//!
//! The single entry through which a user page becomes resident. Given a
//! faulting address, the handler obtains a physical frame (evicting a
//! victim when the pool is dry), consults the faulting process's
//! supplemental page table, and either lazily loads the page from its
//! file, pulls it back from swap, or grows the stack. A fault that fits
//! none of those is a rights violation and the process is killed by the
//! caller.
//!
//! Eviction policy: a victim chosen by the frame-table clock is written
//! back to its file if it is a dirty mmap page; every other victim goes to
//! a fresh swap slot, recorded in the owner's supplemental entry so a
//! later fault can pull it back.

use super::{frame::FrameRec, page::SuppPage, Frame, Va, PHYS_BASE, STACK_LIMIT};
use crate::{kernel::Kernel, proc::Process, KernelError};
use std::sync::Arc;

/// Make the page containing `fault_addr` resident for `process`, or
/// return the error that kills it. `write` tells whether the faulting
/// access was a store.
pub fn handle(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fault_addr: Va,
    write: bool,
) -> Result<(), KernelError> {
    if !fault_addr.is_user() {
        return Err(KernelError::BadAddress);
    }
    let base = fault_addr.page_base();

    // A fault on a resident page is a rights violation, not a miss.
    if process.pagedir.is_present(base) {
        return Err(KernelError::BadAddress);
    }

    let Some(entry) = process.supp.get(base.0) else {
        return grow_stack(kernel, process, fault_addr);
    };
    if write && !entry.writable {
        return Err(KernelError::BadAddress);
    }

    let mut frame = allocate_frame(kernel)?;

    if entry.swapped {
        // Swap-in: restore the bytes, then hand the slot back.
        kernel.swap().read_slot(entry.swap_slot, &mut frame.data)?;
        kernel.swap().set(entry.swap_slot, false);
        process.supp.clear_swapped(base.0);
    } else if let Some(file) = &entry.file {
        let n = file.read_at(&mut frame.data[..entry.read_bytes], entry.offset);
        if n != entry.read_bytes {
            return Err(KernelError::IOError);
        }
        // The remaining zero_bytes are already zero in a fresh frame.
    }

    install(kernel, process, base, frame, entry.writable)
}

/// Install a zero page when the access fits the stack-growth heuristic:
/// at or above the recorded stack pointer, or exactly 4 or 32 bytes below
/// it, and above the fixed stack ceiling.
fn grow_stack(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    fault_addr: Va,
) -> Result<(), KernelError> {
    let esp = process.user_esp();
    let a = fault_addr.0;
    let plausible = a >= esp || a + 4 == esp || a + 32 == esp;
    if !plausible || a < STACK_LIMIT || a >= PHYS_BASE {
        return Err(KernelError::BadAddress);
    }
    let base = fault_addr.page_base();
    process.supp.insert(base.0, SuppPage::zeroed());
    let frame = allocate_frame(kernel)?;
    install(kernel, process, base, frame, true)?;
    process.pagedir.set_stack_mark(base);
    Ok(())
}

fn install(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    base: Va,
    frame: Frame,
    writable: bool,
) -> Result<(), KernelError> {
    process
        .pagedir
        .set_page(base, frame, writable)
        .map_err(|_| KernelError::BadAddress)?;
    kernel.frames().push(FrameRec {
        pd: process.pagedir.clone(),
        va: base,
        process: process.clone(),
    });
    Ok(())
}

/// Take a frame from the pool, evicting resident pages until one is free.
fn allocate_frame(kernel: &Arc<Kernel>) -> Result<Frame, KernelError> {
    loop {
        if let Some(frame) = kernel.pool().try_alloc() {
            return Ok(frame);
        }
        evict_one(kernel)?;
    }
}

/// Push one victim page out of memory.
pub(crate) fn evict_one(kernel: &Arc<Kernel>) -> Result<(), KernelError> {
    let rec = kernel.frames().find_victim().ok_or(KernelError::NoMemory)?;
    let dirty = rec.pd.is_dirty(rec.va);
    let Some(frame) = rec.pd.clear_page(rec.va) else {
        // The owner unmapped it in the meantime; the frame is already free.
        return Ok(());
    };
    let entry = rec.process.supp.get(rec.va.0);
    match entry {
        Some(e) if e.mmaped => {
            // Dirty mmap pages go home to their file, not to swap.
            if dirty {
                let file = e.file.as_ref().expect("mmap page without a file");
                if file.write_at(&frame.data[..e.read_bytes], e.offset) != e.read_bytes {
                    return Err(KernelError::IOError);
                }
            }
        }
        Some(_) => {
            let slot = kernel.swap().scan_and_flip().ok_or(KernelError::NoSpace)?;
            kernel.swap().write_slot(slot, &frame.data)?;
            rec.process.supp.set_swapped(rec.va.0, slot);
        }
        None => panic!("resident page {:?} has no supplemental entry", rec.va),
    }
    // Dropping the frame returns it to the pool.
    drop(frame);
    Ok(())
}
