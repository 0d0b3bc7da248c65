//! Executable loading.
//!
//! The loader runs on the freshly created process thread. It opens the
//! first token of the command line as an executable, validates the ELF
//! header, and installs one supplemental-page entry per page of each
//! loadable segment; no segment byte is read until the first fault on its
//! page. It then materializes the initial stack page and lays out the
//! process arguments the way the entry convention expects: the argument
//! strings (word-padded), a null sentinel, the `argv` pointers in reverse,
//! `argv`, `argc`, and a zero return address. Finally the executable is
//! reopened write-denied for the lifetime of the process.

use super::{
    elf::{Elf, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_SHLIB},
    Process,
};
use crate::{
    kernel::Kernel,
    mm::{fault, page::SuppPage, Va, PAGE_SIZE, PHYS_BASE},
    KernelError,
};
use std::sync::Arc;

pub(crate) struct LoadResult {
    pub entry: usize,
    pub esp: usize,
}

/// Load the executable named by `cmdline` into `process`.
pub(crate) fn load(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    cmdline: &str,
) -> Result<LoadResult, KernelError> {
    let program = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument)?;
    let fs = kernel.filesys()?;
    let file = Arc::new(fs.open_file(process.cwd(), program)?);
    let elf = Elf::from_file(file.clone())?;

    for phdr in elf.phdrs()? {
        match phdr.p_type {
            PT_LOAD => {
                if !segment_valid(&phdr, file.length()) {
                    return Err(KernelError::NoExec);
                }
                install_segment(process, &file, &phdr);
            }
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(KernelError::NoExec),
            _ => {}
        }
    }

    let esp = build_stack(kernel, process, cmdline)?;
    file.deny_write();
    process.set_exec_file(file);
    Ok(LoadResult {
        entry: elf.header.e_entry as usize,
        esp,
    })
}

fn segment_valid(phdr: &super::elf::Phdr, file_len: usize) -> bool {
    let page_mask = (PAGE_SIZE - 1) as u32;
    // File offset and virtual address must agree within the page.
    if phdr.p_offset & page_mask != phdr.p_vaddr & page_mask {
        return false;
    }
    if phdr.p_offset as usize > file_len {
        return false;
    }
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    let start = phdr.p_vaddr as usize;
    let Some(end) = start.checked_add(phdr.p_memsz as usize) else {
        return false;
    };
    // Both ends inside user space; page zero stays unmapped.
    Va(start).is_user() && end <= PHYS_BASE
}

/// Record the lazy-load plan of one segment: `read_bytes` file bytes per
/// page, the rest zero.
fn install_segment(process: &Arc<Process>, file: &Arc<crate::fs::file::File>, phdr: &super::elf::Phdr) {
    let page_mask = PAGE_SIZE - 1;
    let page_offset = phdr.p_vaddr as usize & page_mask;
    let mut upage = phdr.p_vaddr as usize & !page_mask;
    let mut file_offset = phdr.p_offset as usize & !page_mask;
    let (mut read_bytes, mut zero_bytes) = if phdr.p_filesz > 0 {
        let read = page_offset + phdr.p_filesz as usize;
        let total = (page_offset + phdr.p_memsz as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        (read, total - read)
    } else {
        let total = (page_offset + phdr.p_memsz as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        (0, total)
    };
    let writable = phdr.writable();
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;
        process.supp.insert(
            upage,
            SuppPage::from_file(file.clone(), file_offset, page_read, writable, false),
        );
        read_bytes -= page_read;
        zero_bytes -= page_zero;
        file_offset += page_read;
        upage += PAGE_SIZE;
    }
}

/// Lay out the initial user stack and return the stack pointer.
fn build_stack(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    cmdline: &str,
) -> Result<usize, KernelError> {
    let mut stack = StackBuilder::new(kernel, process)?;
    let mut arg_ptrs = Vec::new();
    for arg in cmdline.split_whitespace() {
        arg_ptrs.push(stack.push_str(arg)? as u32);
        stack.align(4);
    }
    // Null sentinel, then argv pointers in reverse.
    stack.push_u32(0)?;
    for ptr in arg_ptrs.iter().rev() {
        stack.push_u32(*ptr)?;
    }
    let argv = stack.sp() as u32;
    stack.push_u32(argv)?;
    stack.push_u32(arg_ptrs.len() as u32)?;
    // Fake return address.
    stack.push_u32(0)?;
    Ok(stack.finish())
}

/// A utility for constructing the user-stack layout.
///
/// The stack starts at [`PHYS_BASE`] and grows downward; pushes move the
/// stack pointer and store through the process page directory. The first
/// stack page is materialized eagerly and carries the current-stack mark.
pub(crate) struct StackBuilder<'a> {
    kernel: &'a Arc<Kernel>,
    process: &'a Arc<Process>,
    sp: usize,
}

impl<'a> StackBuilder<'a> {
    /// Materialize the initial stack page and start at [`PHYS_BASE`].
    pub fn new(kernel: &'a Arc<Kernel>, process: &'a Arc<Process>) -> Result<Self, KernelError> {
        let first = Va(PHYS_BASE - PAGE_SIZE);
        process.supp.insert(first.0, SuppPage::zeroed());
        fault::handle(kernel, process, first, true)?;
        process.pagedir.set_stack_mark(first);
        process.record_esp(PHYS_BASE);
        Ok(Self {
            kernel,
            process,
            sp: PHYS_BASE,
        })
    }

    /// The current stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Round the stack pointer down to a multiple of `align`.
    pub fn align(&mut self, align: usize) {
        self.sp &= !(align - 1);
    }

    /// Push raw bytes, returning their address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<usize, KernelError> {
        let Some(sp) = self.sp.checked_sub(bytes.len()) else {
            return Err(KernelError::InvalidArgument);
        };
        // The argument block must fit in the initial stack page.
        if sp < PHYS_BASE - PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        self.sp = sp;
        self.process.record_esp(sp);
        self.process
            .write_user_raw(self.kernel, Va(sp), bytes)
            .map_err(|_| KernelError::BadAddress)?;
        Ok(sp)
    }

    /// Push a 32-bit word.
    pub fn push_u32(&mut self, v: u32) -> Result<usize, KernelError> {
        self.push_bytes(&v.to_le_bytes())
    }

    /// Push a NUL-terminated string, returning its address.
    pub fn push_str(&mut self, s: &str) -> Result<usize, KernelError> {
        self.push_bytes(&[0u8])?;
        self.push_bytes(s.as_bytes())
    }

    /// Consume the builder, returning the final stack pointer.
    pub fn finish(self) -> usize {
        self.process.record_esp(self.sp);
        self.sp
    }
}
