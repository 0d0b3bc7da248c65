//! The user-mode surface of a process.
//!
//! The host cannot execute guest machine code, so the instruction stream
//! of a user program is represented by a [`UserProgram`] body registered
//! under the program's name. After a successful load, the process thread
//! runs the body with a [`UserCtx`], through which the body behaves
//! exactly like user instructions would: it reads and writes the process
//! address space (taking page faults, growing the stack, getting killed
//! for bad accesses) and enters the kernel only through
//! [`UserCtx::syscall`].

use super::Process;
use crate::{
    kernel::Kernel,
    mm::Va,
    syscall::{self, SysNo, SyscallAbi},
};
use std::sync::Arc;

/// A registered user-program body.
pub type UserProgram = Arc<dyn Fn(&mut UserCtx) -> i32 + Send + Sync + 'static>;

/// The execution context of a process running "in user mode".
pub struct UserCtx {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) process: Arc<Process>,
    /// Entry point recorded by the loader.
    pub entry: usize,
    esp: usize,
}

impl UserCtx {
    pub(crate) fn new(kernel: Arc<Kernel>, process: Arc<Process>, entry: usize, esp: usize) -> Self {
        Self {
            kernel,
            process,
            entry,
            esp,
        }
    }

    /// The current user stack pointer.
    pub fn esp(&self) -> usize {
        self.esp
    }

    /// Move the user stack pointer, as a `sub esp, n` would.
    pub fn set_esp(&mut self, esp: usize) {
        self.esp = esp;
        self.process.record_esp(esp);
    }

    /// The process this context belongs to.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Load bytes from user memory. A bad access kills the process, as
    /// the fault handler would.
    pub fn read(&mut self, va: usize, buf: &mut [u8]) {
        crate::thread::preemption_point();
        let process = self.process.clone();
        if process
            .read_user_raw(&self.kernel, Va(va), buf)
            .is_err()
        {
            super::exit(-1);
        }
    }

    /// Store bytes to user memory. A bad access kills the process.
    pub fn write(&mut self, va: usize, bytes: &[u8]) {
        crate::thread::preemption_point();
        let process = self.process.clone();
        if process
            .write_user_raw(&self.kernel, Va(va), bytes)
            .is_err()
        {
            super::exit(-1);
        }
    }

    /// Load a 32-bit word from user memory.
    pub fn read_u32(&mut self, va: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw);
        u32::from_le_bytes(raw)
    }

    /// Push bytes onto the user stack, returning their address.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let esp = self.esp - bytes.len();
        self.set_esp(esp);
        self.write(esp, bytes);
        esp
    }

    /// `argc` from the initial stack layout.
    pub fn arg_count(&mut self) -> usize {
        self.read_u32(self.esp + 4) as usize
    }

    /// `argv[i]` from the initial stack layout.
    pub fn arg_ptr(&mut self, i: usize) -> usize {
        let argv = self.read_u32(self.esp + 8) as usize;
        self.read_u32(argv + 4 * i) as usize
    }

    /// The string `argv[i]` points at.
    pub fn arg_str(&mut self, i: usize) -> String {
        let ptr = self.arg_ptr(i);
        let process = self.process.clone();
        match process.read_user_cstr(&self.kernel, Va(ptr)) {
            Ok(s) => s,
            Err(_) => super::exit(-1),
        }
    }

    /// Enter the kernel through the system-call gate.
    pub fn syscall(&mut self, no: SysNo, args: [usize; 3]) -> isize {
        syscall::dispatch(
            self,
            SyscallAbi {
                no: no as usize,
                args,
            },
        )
    }

    /// Enter the kernel with a raw system-call number, as a stray `int`
    /// with a bad number would.
    pub fn syscall_raw(&mut self, no: usize, args: [usize; 3]) -> isize {
        syscall::dispatch(self, SyscallAbi { no, args })
    }
}
