//! File system.
//!
//! Composition, bottom to top: the [`cache`] serves every sector access
//! over the disk; the [`freemap`] accounts data sectors and is itself
//! persisted as a file; [`inode`] lays files out over direct and
//! doubly-indirect index blocks; [`dir`] stores name-to-inode bindings in
//! ordinary files; and this module resolves paths and owns formatting and
//! mounting.
//!
//! Formatting bootstraps the free map's self-hosting: the free-map and
//! root sectors are reserved first, the root directory is created, the
//! free-map file is created (allocating its own data sectors through the
//! map it stores), and only then is the bitmap image written into it.

pub mod cache;
pub mod dir;
pub mod file;
pub mod freemap;
pub mod inode;

use crate::{
    dev::{Disk, Sector},
    sync::SpinLock,
    KernelError,
};
use cache::BufferCache;
use dir::Directory;
use file::File;
use freemap::FreeMap;
use inode::Inode;
use std::sync::Arc;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: Sector = Sector(0);
/// Sector of the root directory's inode.
pub const ROOT_SECTOR: Sector = Sector(1);

/// Initial entry capacity of a fresh directory.
const DIR_INIT_ENTRIES: usize = 16;

/// An object named by a path: a regular file or a directory.
pub enum FsObject {
    /// A regular file.
    File(File),
    /// A directory.
    Dir(Directory),
}

/// The mounted file system.
pub struct FileSys {
    pub(crate) cache: BufferCache,
    pub(crate) freemap: SpinLock<FreeMap>,
    pub(crate) open_inodes: SpinLock<Vec<Arc<Inode>>>,
    /// Serializes file growth across threads.
    pub(crate) ext_lock: SpinLock<()>,
}

impl FileSys {
    /// Mount the file system on `disk`, formatting it first when `format`
    /// is set. An unformatted disk must be formatted before the first
    /// mount.
    pub fn mount(disk: Disk, format: bool) -> Result<Arc<FileSys>, KernelError> {
        let sector_count = disk.sector_count();
        let fs = Arc::new(FileSys {
            cache: BufferCache::new(disk),
            freemap: SpinLock::new(FreeMap::new(sector_count)),
            open_inodes: SpinLock::new(Vec::new()),
            ext_lock: SpinLock::new(()),
        });
        if format {
            fs.format()?;
        } else {
            fs.load_free_map()?;
        }
        Ok(fs)
    }

    fn format(self: &Arc<Self>) -> Result<(), KernelError> {
        {
            let mut freemap = self.freemap.lock();
            freemap.mark(FREE_MAP_SECTOR);
            freemap.mark(ROOT_SECTOR);
            freemap.unlock();
        }
        Directory::create(self, ROOT_SECTOR, ROOT_SECTOR, DIR_INIT_ENTRIES)?;
        // The free-map file allocates its own storage through the map; the
        // final image, written afterwards, accounts for those sectors too.
        let image_len = {
            let freemap = self.freemap.lock();
            let len = freemap.to_bytes().len();
            freemap.unlock();
            len
        };
        Inode::create(self, FREE_MAP_SECTOR, image_len, inode::pack_info(false, 0))?;
        self.store_free_map()?;
        self.cache.flush_all()
    }

    fn load_free_map(self: &Arc<Self>) -> Result<(), KernelError> {
        let inode = Inode::open(self, FREE_MAP_SECTOR)?;
        let mut image = vec![0u8; inode.length()];
        let n = inode.read_at(self, &mut image, 0);
        Inode::close(self, &inode);
        if n != image.len() {
            return Err(KernelError::FilesystemCorrupted("short free-map file"));
        }
        let mut freemap = self.freemap.lock();
        let sectors = freemap.sector_count();
        *freemap = FreeMap::from_bytes(&image, sectors);
        freemap.unlock();
        Ok(())
    }

    fn store_free_map(self: &Arc<Self>) -> Result<(), KernelError> {
        let image = {
            let freemap = self.freemap.lock();
            let image = freemap.to_bytes();
            freemap.unlock();
            image
        };
        let inode = Inode::open(self, FREE_MAP_SECTOR)?;
        let n = inode.write_at(self, &image, 0);
        Inode::close(self, &inode);
        if n != image.len() {
            return Err(KernelError::NoSpace);
        }
        Ok(())
    }

    /// Write the free map back and flush every dirty cache slot. Called on
    /// orderly shutdown.
    pub fn sync(self: &Arc<Self>) -> Result<(), KernelError> {
        self.store_free_map()?;
        self.cache.flush_all()
    }

    /// Flush dirty cache slots without closing anything. The write-behind
    /// thread calls this periodically.
    pub fn flush(&self) -> Result<(), KernelError> {
        self.cache.flush_all()
    }

    /// Walk `path` from `cwd` down to the directory that would hold its
    /// final component, returning that directory and the component.
    fn resolve_parent(
        self: &Arc<Self>,
        cwd: Sector,
        path: &str,
    ) -> Result<(Directory, String), KernelError> {
        let start = if path.starts_with('/') { ROOT_SECTOR } else { cwd };
        let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(last) = parts.pop() else {
            return Err(KernelError::InvalidArgument);
        };
        let mut dir = Directory::open(self, Inode::open(self, start)?)?;
        for part in parts {
            let sector = dir.lookup(part).ok_or(KernelError::NoSuchEntry)?;
            dir = Directory::open(self, Inode::open(self, sector)?)?;
        }
        Ok((dir, last.to_string()))
    }

    /// Create a regular file of `initial_size` bytes at `path`. The final
    /// component must not already exist.
    pub fn create(
        self: &Arc<Self>,
        cwd: Sector,
        path: &str,
        initial_size: usize,
    ) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        if dir.lookup(&name).is_some() {
            return Err(KernelError::FileExist);
        }
        let sector = {
            let mut freemap = self.freemap.lock();
            let s = freemap.allocate(1);
            freemap.unlock();
            s.ok_or(KernelError::NoSpace)?
        };
        if let Err(e) = Inode::create(self, sector, initial_size, inode::pack_info(false, 0)) {
            let mut freemap = self.freemap.lock();
            freemap.release(sector, 1);
            freemap.unlock();
            return Err(e);
        }
        if let Err(e) = dir.add(&name, sector) {
            self.discard_orphan(sector);
            return Err(e);
        }
        Ok(())
    }

    /// Free an inode that was created but never linked into a directory,
    /// along with every block it holds.
    fn discard_orphan(self: &Arc<Self>, sector: Sector) {
        if let Ok(inode) = Inode::open(self, sector) {
            inode.remove();
            Inode::close(self, &inode);
        }
    }

    /// Create a directory at `path`.
    pub fn mkdir(self: &Arc<Self>, cwd: Sector, path: &str) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        if dir.lookup(&name).is_some() {
            return Err(KernelError::FileExist);
        }
        let sector = {
            let mut freemap = self.freemap.lock();
            let s = freemap.allocate(1);
            freemap.unlock();
            s.ok_or(KernelError::NoSpace)?
        };
        if let Err(e) = Directory::create(self, sector, dir.inode.inumber(), DIR_INIT_ENTRIES) {
            let mut freemap = self.freemap.lock();
            freemap.release(sector, 1);
            freemap.unlock();
            return Err(e);
        }
        if let Err(e) = dir.add(&name, sector) {
            self.discard_orphan(sector);
            return Err(e);
        }
        Ok(())
    }

    /// Open the object named by `path`.
    pub fn open(self: &Arc<Self>, cwd: Sector, path: &str) -> Result<FsObject, KernelError> {
        if !path.is_empty() && path.chars().all(|c| c == '/') {
            return Ok(FsObject::Dir(Directory::open_root(self)?));
        }
        let (dir, name) = self.resolve_parent(cwd, path)?;
        let sector = dir.lookup(&name).ok_or(KernelError::NoSuchEntry)?;
        let inode = Inode::open(self, sector)?;
        if inode.is_removed() {
            Inode::close(self, &inode);
            return Err(KernelError::NoSuchEntry);
        }
        if inode.is_directory() {
            Ok(FsObject::Dir(Directory::open(self, inode)?))
        } else {
            Ok(FsObject::File(File::new(self.clone(), inode)))
        }
    }

    /// Open `path` as a regular file.
    pub fn open_file(self: &Arc<Self>, cwd: Sector, path: &str) -> Result<File, KernelError> {
        match self.open(cwd, path)? {
            FsObject::File(f) => Ok(f),
            FsObject::Dir(_) => Err(KernelError::IsDirectory),
        }
    }

    /// Remove the object named by `path`. Directories must be empty and
    /// not held open; files lose their blocks once the last opener closes.
    pub fn remove(self: &Arc<Self>, cwd: Sector, path: &str) -> Result<(), KernelError> {
        if !path.is_empty() && path.chars().all(|c| c == '/') {
            return Err(KernelError::InvalidArgument);
        }
        let (dir, name) = self.resolve_parent(cwd, path)?;
        dir.remove(&name)
    }

    /// Resolve `path` to a directory and return its sector, the new
    /// working directory of the caller.
    pub fn chdir(self: &Arc<Self>, cwd: Sector, path: &str) -> Result<Sector, KernelError> {
        match self.open(cwd, path)? {
            FsObject::Dir(d) => Ok(d.inode.inumber()),
            FsObject::File(_) => Err(KernelError::NotDirectory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;

    fn fresh(sectors: usize) -> Arc<FileSys> {
        FileSys::mount(Disk::new(MemDisk::new(sectors)), true).unwrap()
    }

    #[test]
    fn format_creates_root_and_free_map() {
        let fs = fresh(256);
        let root = Directory::open_root(&fs).unwrap();
        assert!(root.is_empty());
        assert_eq!(root.inode.level(), 0);
        let freemap = fs.freemap.lock();
        assert!(freemap.is_used(FREE_MAP_SECTOR));
        assert!(freemap.is_used(ROOT_SECTOR));
        freemap.unlock();
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fresh(256);
        fs.create(ROOT_SECTOR, "a", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "a").unwrap();
        assert_eq!(f.write(b"ABCDE"), 5);
        drop(f);
        let f = fs.open_file(ROOT_SECTOR, "/a").unwrap();
        let mut out = [0u8; 10];
        assert_eq!(f.read(&mut out), 5);
        assert_eq!(&out[..5], b"ABCDE");
    }

    #[test]
    fn growth_across_indirect_boundary() {
        // 128 KiB starting at offset 0 spills past the 123 direct sectors;
        // the doubly-indirect pointer must come alive and the data must
        // read back intact.
        let fs = fresh(512);
        fs.create(ROOT_SECTOR, "big", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "big").unwrap();
        let data: Vec<u8> = (0..131072usize).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(f.write(&data), data.len());
        assert_eq!(f.length(), 131072);
        {
            let state = f.inode().state.lock();
            let doubly = state.data.doubly_indirect;
            state.unlock();
            assert!(doubly >= 0, "doubly indirect pointer still unset");
        }
        let mut out = vec![0u8; data.len()];
        assert_eq!(f.read_at(&mut out, 0), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn sparse_write_reads_zero_gap() {
        let fs = fresh(256);
        fs.create(ROOT_SECTOR, "s", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "s").unwrap();
        assert_eq!(f.write_at(b"xy", 2000), 2);
        assert_eq!(f.length(), 2002);
        let mut out = vec![0xffu8; 2002];
        assert_eq!(f.read_at(&mut out, 0), 2002);
        assert!(out[..2000].iter().all(|&b| b == 0));
        assert_eq!(&out[2000..], b"xy");
    }

    #[test]
    fn growth_failure_rolls_back() {
        // A tiny disk cannot hold a large file; the failed growth must not
        // leak sectors or change the length.
        let fs = fresh(64);
        fs.create(ROOT_SECTOR, "t", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "t").unwrap();
        assert_eq!(f.write(b"ok"), 2);
        let used_before = {
            let fm = fs.freemap.lock();
            let n = fm.used_count();
            fm.unlock();
            n
        };
        let huge = vec![0u8; 64 * 512];
        assert_eq!(f.write_at(&huge, 0), 0);
        assert_eq!(f.length(), 2);
        let used_after = {
            let fm = fs.freemap.lock();
            let n = fm.used_count();
            fm.unlock();
            n
        };
        assert_eq!(used_before, used_after);
    }

    #[test]
    fn subdirectories_and_paths() {
        let fs = fresh(256);
        fs.mkdir(ROOT_SECTOR, "d").unwrap();
        fs.mkdir(ROOT_SECTOR, "/d/e").unwrap();
        fs.create(ROOT_SECTOR, "/d/e/f", 10).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "/d/e/f").unwrap();
        assert_eq!(f.length(), 10);
        drop(f);
        // Relative resolution from a changed working directory.
        let d = fs.chdir(ROOT_SECTOR, "d").unwrap();
        let f = fs.open_file(d, "e/f").unwrap();
        assert_eq!(f.length(), 10);
        drop(f);
        // Dot components resolve through the stored entries.
        let f = fs.open_file(d, "./e/../e/f").unwrap();
        assert_eq!(f.length(), 10);
        drop(f);
        // Depth levels.
        let e = fs.chdir(d, "e").unwrap();
        let einode = Inode::open(&fs, e).unwrap();
        assert_eq!(einode.level(), 2);
        Inode::close(&fs, &einode);
    }

    #[test]
    fn remove_semantics() {
        let fs = fresh(256);
        fs.create(ROOT_SECTOR, "gone", 512).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "gone").unwrap();
        fs.remove(ROOT_SECTOR, "gone").unwrap();
        // Still readable through the open handle; invisible by name.
        assert!(fs.open_file(ROOT_SECTOR, "gone").is_err());
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf), 4);
        let used_open = {
            let fm = fs.freemap.lock();
            let n = fm.used_count();
            fm.unlock();
            n
        };
        drop(f);
        let used_closed = {
            let fm = fs.freemap.lock();
            let n = fm.used_count();
            fm.unlock();
            n
        };
        // Inode sector plus one data sector came back.
        assert_eq!(used_open - used_closed, 2);
        // A non-empty directory refuses removal.
        fs.mkdir(ROOT_SECTOR, "d").unwrap();
        fs.create(ROOT_SECTOR, "d/x", 0).unwrap();
        assert_eq!(
            fs.remove(ROOT_SECTOR, "d"),
            Err(KernelError::DirectoryNotEmpty)
        );
        fs.remove(ROOT_SECTOR, "d/x").unwrap();
        fs.remove(ROOT_SECTOR, "d").unwrap();
    }

    #[test]
    fn persistence_across_mounts() {
        let disk = Disk::new(MemDisk::new(256));
        {
            let fs = FileSys::mount(disk.clone(), true).unwrap();
            fs.create(ROOT_SECTOR, "keep", 0).unwrap();
            let f = fs.open_file(ROOT_SECTOR, "keep").unwrap();
            f.write(b"persisted");
            drop(f);
            fs.sync().unwrap();
        }
        let fs = FileSys::mount(disk, false).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "keep").unwrap();
        let mut out = [0u8; 9];
        assert_eq!(f.read(&mut out), 9);
        assert_eq!(&out, b"persisted");
    }
}
