//! # SeOS: a Simple Educational Operating System
//!
//! SeOS is a small kernel built to teach the classic mechanisms of operating
//! system design: a priority scheduler with donation, demand paging with a
//! swap area, a write-back buffer cache over an indexed-inode file system,
//! and a process lifecycle with `exec`/`wait` semantics.
//!
//! The kernel runs on a *host machine*: kernel threads are host threads
//! disciplined into a single-CPU model (exactly one thread owns the CPU at
//! any time), the timer is a host ticker that drives the kernel tick entry,
//! and block devices are in-memory sector arrays behind the
//! [`dev::BlockDevice`] trait. Everything above that boundary is the real
//! thing: the scheduler decides who runs, page faults are serviced by lazy
//! loads and swap-ins, and file contents travel through the buffer cache.
//!
//! The major subsystems:
//!
//! - [`thread`]: thread creation, blocking, the ready queue and schedulers.
//! - [`sync`]: spinlock, semaphore, lock with priority donation, condition
//!   variable.
//! - [`timer`]: tick accounting and timed sleep.
//! - [`mm`]: user frames, the frame table with clock eviction, the swap
//!   area, supplemental page tables and the page-fault handler.
//! - [`fs`]: buffer cache, free map, inodes, directories and path lookup.
//! - [`proc`]: executable loading, argument passing, process join and exit.
//! - [`syscall`]: the system-call surface.
//! - [`kernel`]: boot configuration and the assembled machine.

pub mod console;
pub mod dev;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod timer;

pub use kernel::{Kernel, KernelBuilder};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while servicing a request. These errors can be returned to a user program
/// to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding negative error
    /// code, for use as a system-call return value.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

impl TryFrom<isize> for KernelError {
    type Error = ();

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -17 => Ok(Self::FileExist),
            -20 => Ok(Self::NotDirectory),
            -21 => Ok(Self::IsDirectory),
            -22 => Ok(Self::InvalidArgument),
            -24 => Ok(Self::TooManyOpenFile),
            -28 => Ok(Self::NoSpace),
            -36 => Ok(Self::NameTooLong),
            -38 => Ok(Self::NoSuchSyscall),
            -39 => Ok(Self::DirectoryNotEmpty),
            -117 => Ok(Self::FilesystemCorrupted("")),
            -524 => Ok(Self::NotSupportedOperation),
            _ => Err(()),
        }
    }
}
