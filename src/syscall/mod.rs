//! System-call surface.
//!
//! User programs enter the kernel here. Arguments arrive as raw words;
//! pointers among them are only ever dereferenced through the process
//! address space, so a bad pointer kills the offending process rather
//! than the kernel. Every call has a fixed failure sentinel (false, -1 or
//! 0); no errno channel is surfaced to user space.
//!
//! File-touching calls serialize on the kernel's global file lock, the
//! donation-capable lock, so a high-priority process is not starved of
//! file service by a preempted low-priority one.

use crate::{
    fs::FsObject,
    mm::Va,
    proc::{self, user::UserCtx, FdEntry},
    thread, KernelError,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;

/// System-call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum SysNo {
    /// Power the machine off.
    Halt = 0,
    /// Terminate the calling process.
    Exit,
    /// Run a new process from a command line.
    Exec,
    /// Join a child process.
    Wait,
    /// Create a file.
    Create,
    /// Remove a file or empty directory.
    Remove,
    /// Open a file or directory.
    Open,
    /// Size of an open file.
    Filesize,
    /// Read from an open file.
    Read,
    /// Write to an open file or the console.
    Write,
    /// Set the position of an open file.
    Seek,
    /// Report the position of an open file.
    Tell,
    /// Close a descriptor.
    Close,
    /// Map an open file into memory.
    Mmap,
    /// Tear down a memory mapping.
    Munmap,
    /// Change the working directory.
    Chdir,
    /// Create a directory.
    Mkdir,
    /// Read one directory entry.
    Readdir,
    /// Whether a descriptor names a directory.
    Isdir,
    /// Inode number behind a descriptor.
    Inumber,
}

/// The register image of a system call: a number and three argument
/// words.
pub struct SyscallAbi {
    /// System-call number.
    pub no: usize,
    /// Raw argument words.
    pub args: [usize; 3],
}

/// Read a NUL-terminated string argument; a bad pointer kills the caller,
/// a malformed string is reported to it.
fn user_cstr(ctx: &mut UserCtx, ptr: usize) -> Result<String, KernelError> {
    let process = ctx.process().clone();
    match process.read_user_cstr(&ctx.kernel, Va(ptr)) {
        Ok(s) => Ok(s),
        Err(KernelError::BadAddress) => proc::exit(-1),
        Err(e) => Err(e),
    }
}

fn fd_file(ctx: &UserCtx, fd: i32) -> Option<Arc<crate::fs::file::File>> {
    ctx.process()
        .with_fd(fd, |entry| match entry {
            FdEntry::File(f) => Some(f.clone()),
            FdEntry::Dir { .. } => None,
        })
        .ok()
        .flatten()
}

/// Dispatch one system call on behalf of the current process.
pub(crate) fn dispatch(ctx: &mut UserCtx, abi: SyscallAbi) -> isize {
    thread::preemption_point();
    let Ok(no) = SysNo::try_from(abi.no) else {
        // An unknown number is an attack or a wild jump; kill the caller.
        proc::exit(-1);
    };
    let [a0, a1, a2] = abi.args;
    match no {
        SysNo::Halt => {
            ctx.kernel.halt();
            thread::exit(0);
        }
        SysNo::Exit => proc::exit(a0 as i32),
        SysNo::Exec => match user_cstr(ctx, a0).map(|cmd| proc::exec(&cmd)) {
            Ok(Ok(tid)) => tid as isize,
            _ => -1,
        },
        SysNo::Wait => proc::wait(a0 as u64) as isize,
        SysNo::Create => sys_create(ctx, a0, a1),
        SysNo::Remove => sys_remove(ctx, a0),
        SysNo::Open => sys_open(ctx, a0),
        SysNo::Filesize => match fd_file(ctx, a0 as i32) {
            Some(f) => f.length() as isize,
            None => -1,
        },
        SysNo::Read => sys_read(ctx, a0 as i32, a1, a2 as isize),
        SysNo::Write => sys_write(ctx, a0 as i32, a1, a2 as isize),
        SysNo::Seek => match fd_file(ctx, a0 as i32) {
            Some(f) => {
                f.seek(a1);
                0
            }
            None => -1,
        },
        SysNo::Tell => match fd_file(ctx, a0 as i32) {
            Some(f) => f.tell() as isize,
            None => -1,
        },
        SysNo::Close => match ctx.process().take_fd(a0 as i32) {
            Some(entry) => {
                drop(entry);
                0
            }
            None => -1,
        },
        SysNo::Mmap => match fd_file(ctx, a0 as i32) {
            Some(f) => match proc::mmap::mmap(ctx.process(), &f, Va(a1)) {
                Ok(mid) => mid as isize,
                Err(_) => -1,
            },
            None => -1,
        },
        SysNo::Munmap => {
            let process = ctx.process().clone();
            match proc::mmap::munmap(&ctx.kernel, &process, a0 as i32) {
                Ok(()) => 0,
                Err(_) => -1,
            }
        }
        SysNo::Chdir => sys_chdir(ctx, a0),
        SysNo::Mkdir => sys_mkdir(ctx, a0),
        SysNo::Readdir => sys_readdir(ctx, a0 as i32, a1),
        SysNo::Isdir => ctx
            .process()
            .with_fd(a0 as i32, |entry| matches!(entry, FdEntry::Dir { .. }))
            .map(|b| b as isize)
            .unwrap_or(-1),
        SysNo::Inumber => ctx
            .process()
            .with_fd(a0 as i32, |entry| match entry {
                FdEntry::File(f) => f.inumber().into_usize() as isize,
                FdEntry::Dir { dir, .. } => dir.inode.inumber().into_usize() as isize,
            })
            .unwrap_or(-1),
    }
}

fn sys_create(ctx: &mut UserCtx, name_ptr: usize, size: usize) -> isize {
    let Ok(name) = user_cstr(ctx, name_ptr) else {
        return 0;
    };
    if (size as isize) < 0 {
        return 0;
    }
    let Ok(fs) = ctx.kernel.filesys() else {
        return 0;
    };
    let lock = ctx.kernel.file_lock();
    lock.acquire();
    let created = fs.create(ctx.process().cwd(), &name, size).is_ok();
    lock.release();
    created as isize
}

fn sys_remove(ctx: &mut UserCtx, name_ptr: usize) -> isize {
    let Ok(name) = user_cstr(ctx, name_ptr) else {
        return 0;
    };
    let Ok(fs) = ctx.kernel.filesys() else {
        return 0;
    };
    let lock = ctx.kernel.file_lock();
    lock.acquire();
    let removed = fs.remove(ctx.process().cwd(), &name).is_ok();
    lock.release();
    removed as isize
}

fn sys_open(ctx: &mut UserCtx, name_ptr: usize) -> isize {
    let Ok(name) = user_cstr(ctx, name_ptr) else {
        return -1;
    };
    let Ok(fs) = ctx.kernel.filesys() else {
        return -1;
    };
    let lock = ctx.kernel.file_lock();
    lock.acquire();
    let opened = fs.open(ctx.process().cwd(), &name);
    lock.release();
    let entry = match opened {
        Ok(FsObject::File(f)) => FdEntry::File(Arc::new(f)),
        Ok(FsObject::Dir(dir)) => FdEntry::Dir { dir, pos: 0 },
        Err(_) => return -1,
    };
    match ctx.process().install_fd(entry) {
        Ok(fd) => fd as isize,
        Err(_) => -1,
    }
}

fn sys_read(ctx: &mut UserCtx, fd: i32, buf: usize, size: isize) -> isize {
    if size <= 0 {
        // A negative length reads nothing.
        return 0;
    }
    match fd {
        0 => 0,
        1 | 2 => -1,
        _ => {
            let Some(file) = fd_file(ctx, fd) else {
                return -1;
            };
            let mut kbuf = vec![0u8; size as usize];
            let lock = ctx.kernel.file_lock();
            lock.acquire();
            let n = file.read(&mut kbuf);
            lock.release();
            ctx.write(buf, &kbuf[..n]);
            n as isize
        }
    }
}

fn sys_write(ctx: &mut UserCtx, fd: i32, buf: usize, size: isize) -> isize {
    if size <= 0 {
        return 0;
    }
    let mut kbuf = vec![0u8; size as usize];
    ctx.read(buf, &mut kbuf);
    match fd {
        0 => -1,
        1 | 2 => {
            ctx.kernel.console().write_bytes(&kbuf);
            size
        }
        _ => {
            let Some(file) = fd_file(ctx, fd) else {
                return -1;
            };
            let lock = ctx.kernel.file_lock();
            lock.acquire();
            let n = file.write(&kbuf);
            lock.release();
            n as isize
        }
    }
}

fn sys_chdir(ctx: &mut UserCtx, path_ptr: usize) -> isize {
    let Ok(path) = user_cstr(ctx, path_ptr) else {
        return 0;
    };
    let Ok(fs) = ctx.kernel.filesys() else {
        return 0;
    };
    match fs.chdir(ctx.process().cwd(), &path) {
        Ok(sector) => {
            ctx.process().set_cwd(sector);
            1
        }
        Err(_) => 0,
    }
}

fn sys_mkdir(ctx: &mut UserCtx, path_ptr: usize) -> isize {
    let Ok(path) = user_cstr(ctx, path_ptr) else {
        return 0;
    };
    let Ok(fs) = ctx.kernel.filesys() else {
        return 0;
    };
    let lock = ctx.kernel.file_lock();
    lock.acquire();
    let made = fs.mkdir(ctx.process().cwd(), &path).is_ok();
    lock.release();
    made as isize
}

fn sys_readdir(ctx: &mut UserCtx, fd: i32, name_ptr: usize) -> isize {
    let next = ctx.process().with_fd(fd, |entry| match entry {
        FdEntry::Dir { dir, pos } => dir.readdir(pos),
        FdEntry::File(_) => None,
    });
    match next {
        Ok(Some(name)) => {
            let mut bytes = name.into_bytes();
            bytes.push(0);
            ctx.write(name_ptr, &bytes);
            1
        }
        _ => 0,
    }
}
