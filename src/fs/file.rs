//! File handles.
//!
//! A [`File`] couples an open inode with a byte position. Reads and writes
//! advance the position; `read_at`/`write_at` take explicit offsets and
//! leave it alone (the fault handler and mmap write-back use those).
//! Dropping the handle closes the inode, re-enabling writes first if this
//! handle denied them.

use super::{inode::Inode, FileSys};
use crate::{dev::Sector, sync::SpinLock};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// An open file.
pub struct File {
    fs: Arc<FileSys>,
    inode: Arc<Inode>,
    pos: SpinLock<usize>,
    denies_write: AtomicBool,
}

impl File {
    /// Wrap an open inode into a handle positioned at byte 0.
    pub fn new(fs: Arc<FileSys>, inode: Arc<Inode>) -> Self {
        Self {
            fs,
            inode,
            pos: SpinLock::new(0),
            denies_write: AtomicBool::new(false),
        }
    }

    /// Open an independent handle to the same inode, positioned at 0.
    pub fn reopen(&self) -> File {
        File::new(self.fs.clone(), self.inode.reopen())
    }

    /// Sector of the backing inode.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// Current length of the file in bytes.
    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// Read from the current position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(&self.fs, buf, *pos);
        *pos += n;
        pos.unlock();
        n
    }

    /// Write at the current position, advancing it.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(&self.fs, buf, *pos);
        *pos += n;
        pos.unlock();
        n
    }

    /// Read at an explicit offset without touching the position.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(&self.fs, buf, offset)
    }

    /// Write at an explicit offset without touching the position.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(&self.fs, buf, offset)
    }

    /// Move the position to `pos` bytes from the start of the file.
    pub fn seek(&self, pos: usize) {
        let mut guard = self.pos.lock();
        *guard = pos;
        guard.unlock();
    }

    /// Current position.
    pub fn tell(&self) -> usize {
        let guard = self.pos.lock();
        let pos = *guard;
        guard.unlock();
        pos
    }

    /// Deny writes to the backing inode for the lifetime of this handle.
    /// Used by the loader on a running executable.
    pub fn deny_write(&self) {
        if !self.denies_write.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    /// Whether the backing inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.inode.is_directory()
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.denies_write.load(Ordering::SeqCst) {
            self.inode.allow_write();
        }
        Inode::close(&self.fs, &self.inode);
    }
}
