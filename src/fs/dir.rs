//! Directories.
//!
//! A directory is a file whose inode carries the directory bit and whose
//! contents are an array of fixed-size entries. Every directory is created
//! with `.` and `..` entries capturing its own sector and its parent's, so
//! path components resolve through ordinary entry lookup. The depth of a
//! directory is stored in the inode's `info` field, one more than its
//! parent's.

use super::{inode, FileSys};
use crate::{dev::Sector, fs::inode::Inode, KernelError};
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Longest permitted entry name.
pub const NAME_MAX: usize = 26;
/// Size of one on-disk directory entry.
pub const ENTRY_SIZE: usize = 32;

/// On-disk directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntryDisk {
    in_use: u8,
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
}
const_assert_eq!(core::mem::size_of::<DirEntryDisk>(), ENTRY_SIZE);

impl DirEntryDisk {
    fn empty() -> Self {
        Self {
            in_use: 0,
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
        }
    }

    fn new(name: &str, sector: Sector) -> Self {
        let mut e = Self {
            in_use: 1,
            inode_sector: sector.0,
            name: [0; NAME_MAX + 1],
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e
    }

    fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn sector(&self) -> Sector {
        Sector({ self.inode_sector })
    }
}

/// An open directory.
pub struct Directory {
    fs: Arc<FileSys>,
    pub inode: Arc<Inode>,
}

impl Directory {
    /// Initialize a directory at `sector` with room for `entry_cnt` entries
    /// and `.`/`..` entries referring to itself and `parent_sector`. The
    /// caller has already reserved `sector` in the free map.
    pub fn create(
        fs: &Arc<FileSys>,
        sector: Sector,
        parent_sector: Sector,
        entry_cnt: usize,
    ) -> Result<(), KernelError> {
        let level = if sector == parent_sector {
            0
        } else {
            let parent = Inode::open(fs, parent_sector)?;
            let level = parent.level() + 1;
            Inode::close(fs, &parent);
            level
        };
        let length = entry_cnt.max(2) * ENTRY_SIZE;
        Inode::create(fs, sector, length, inode::pack_info(true, level))?;
        let dir = Directory::open(fs, Inode::open(fs, sector)?)?;
        dir.write_entry(0, &DirEntryDisk::new(".", sector))?;
        dir.write_entry(1, &DirEntryDisk::new("..", parent_sector))?;
        Ok(())
    }

    /// Wrap an open inode as a directory.
    pub fn open(fs: &Arc<FileSys>, inode: Arc<Inode>) -> Result<Directory, KernelError> {
        if !inode.is_directory() {
            Inode::close(fs, &inode);
            return Err(KernelError::NotDirectory);
        }
        Ok(Directory {
            fs: fs.clone(),
            inode,
        })
    }

    /// Open the root directory.
    pub fn open_root(fs: &Arc<FileSys>) -> Result<Directory, KernelError> {
        let inode = Inode::open(fs, super::ROOT_SECTOR)?;
        Directory::open(fs, inode)
    }

    fn capacity(&self) -> usize {
        self.inode.length() / ENTRY_SIZE
    }

    fn read_entry(&self, index: usize) -> Option<DirEntryDisk> {
        let mut e = DirEntryDisk::empty();
        let n = self
            .inode
            .read_at(&self.fs, e.as_bytes_mut(), index * ENTRY_SIZE);
        (n == ENTRY_SIZE).then_some(e)
    }

    fn write_entry(&self, index: usize, e: &DirEntryDisk) -> Result<(), KernelError> {
        let n = self.inode.write_at(&self.fs, e.as_bytes(), index * ENTRY_SIZE);
        if n == ENTRY_SIZE {
            Ok(())
        } else {
            Err(KernelError::NoSpace)
        }
    }

    fn find(&self, name: &str) -> Option<(usize, DirEntryDisk)> {
        (0..self.capacity())
            .filter_map(|i| self.read_entry(i).map(|e| (i, e)))
            .find(|(_, e)| e.in_use != 0 && e.name_str() == name)
    }

    /// Look up `name`, returning the sector of its inode.
    pub fn lookup(&self, name: &str) -> Option<Sector> {
        self.find(name).map(|(_, e)| e.sector())
    }

    /// Add an entry binding `name` to `sector`.
    pub fn add(&self, name: &str, sector: Sector) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.find(name).is_some() {
            return Err(KernelError::FileExist);
        }
        let slot = (0..self.capacity())
            .find(|&i| matches!(self.read_entry(i), Some(e) if e.in_use == 0))
            // No free slot: append, growing the directory file.
            .unwrap_or_else(|| self.capacity());
        self.write_entry(slot, &DirEntryDisk::new(name, sector))
    }

    /// Remove the entry for `name`, marking its inode for deletion.
    ///
    /// A directory entry is only removed when the directory it names is
    /// empty and nobody else holds it open.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let Some((index, e)) = self.find(name) else {
            return Err(KernelError::NoSuchEntry);
        };
        let target = Inode::open(&self.fs, e.sector())?;
        if target.is_directory() {
            let dir = Directory::open(&self.fs, target)?;
            if !dir.is_empty() {
                return Err(KernelError::DirectoryNotEmpty);
            }
            if dir.inode.open_count() > 1 {
                return Err(KernelError::OperationNotPermitted);
            }
            dir.inode.remove();
        } else {
            target.remove();
            Inode::close(&self.fs, &target);
        }
        let mut cleared = e;
        cleared.in_use = 0;
        self.write_entry(index, &cleared)
    }

    /// Yield the next entry name at or after `*pos`, skipping `.` and `..`,
    /// and advance `*pos` past it.
    pub fn readdir(&self, pos: &mut usize) -> Option<String> {
        while *pos < self.capacity() {
            let e = self.read_entry(*pos)?;
            *pos += 1;
            if e.in_use != 0 && e.name_str() != "." && e.name_str() != ".." {
                return Some(e.name_str().to_string());
            }
        }
        None
    }

    /// Whether the directory holds no entries besides `.` and `..`.
    pub fn is_empty(&self) -> bool {
        (0..self.capacity())
            .filter_map(|i| self.read_entry(i))
            .all(|e| e.in_use == 0 || e.name_str() == "." || e.name_str() == "..")
    }
}

impl Clone for Directory {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            inode: self.inode.reopen(),
        }
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        Inode::close(&self.fs, &self.inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dev::{Disk, MemDisk},
        fs::ROOT_SECTOR,
        KernelError,
    };

    fn fresh() -> Arc<FileSys> {
        FileSys::mount(Disk::new(MemDisk::new(256)), true).unwrap()
    }

    fn alloc_sector(fs: &Arc<FileSys>) -> Sector {
        let mut freemap = fs.freemap.lock();
        let s = freemap.allocate(1).unwrap();
        freemap.unlock();
        s
    }

    fn make_file(fs: &Arc<FileSys>) -> Sector {
        let s = alloc_sector(fs);
        Inode::create(fs, s, 0, inode::pack_info(false, 0)).unwrap();
        s
    }

    #[test]
    fn add_lookup_remove() {
        let fs = fresh();
        let root = Directory::open_root(&fs).unwrap();
        let a = make_file(&fs);
        let b = make_file(&fs);
        root.add("alpha", a).unwrap();
        root.add("beta", b).unwrap();
        assert_eq!(root.lookup("alpha"), Some(a));
        assert_eq!(root.lookup("beta"), Some(b));
        assert_eq!(root.lookup("gamma"), None);
        assert_eq!(root.add("alpha", b), Err(KernelError::FileExist));
        root.remove("alpha").unwrap();
        assert_eq!(root.lookup("alpha"), None);
        assert_eq!(root.remove("alpha"), Err(KernelError::NoSuchEntry));
        // The freed slot is reused rather than growing the file.
        let len = root.inode.length();
        let c = make_file(&fs);
        root.add("gamma", c).unwrap();
        assert_eq!(root.inode.length(), len);
    }

    #[test]
    fn names_are_bounded() {
        let fs = fresh();
        let root = Directory::open_root(&fs).unwrap();
        let file = make_file(&fs);
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(root.add(&long, file), Err(KernelError::NameTooLong));
        let fits = "y".repeat(NAME_MAX);
        root.add(&fits, file).unwrap();
        assert_eq!(root.lookup(&fits), Some(file));
    }

    #[test]
    fn readdir_skips_dot_entries() {
        let fs = fresh();
        let sector = alloc_sector(&fs);
        Directory::create(&fs, sector, ROOT_SECTOR, 16).unwrap();
        let dir = Directory::open(&fs, Inode::open(&fs, sector).unwrap()).unwrap();
        // Dot entries resolve but are not listed.
        assert_eq!(dir.lookup("."), Some(sector));
        assert_eq!(dir.lookup(".."), Some(ROOT_SECTOR));
        let file = make_file(&fs);
        dir.add("only", file).unwrap();
        let mut pos = 0;
        assert_eq!(dir.readdir(&mut pos).as_deref(), Some("only"));
        assert_eq!(dir.readdir(&mut pos), None);
        assert_eq!(dir.inode.level(), 1);
        assert!(!dir.is_empty());
    }

    #[test]
    fn entries_grow_the_directory() {
        let fs = fresh();
        let root = Directory::open_root(&fs).unwrap();
        let before = root.inode.length();
        for i in 0..40 {
            let f = make_file(&fs);
            root.add(&format!("file-{i}"), f).unwrap();
        }
        assert!(root.inode.length() > before);
        assert_eq!(root.lookup("file-39").is_some(), true);
    }
}
