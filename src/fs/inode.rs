//! Indexed inodes.
//!
//! An inode is the on-disk metadata of a file or directory: identity,
//! length, a directory bit with a depth field, and the index of its data
//! sectors. The index is tiered: [`DIRECT_N`] direct slots inside the inode
//! record itself, then a doubly-indirect block fanning out to up to
//! [`INDIRECT_FANOUT`] indirect blocks of [`INDIRECT_FANOUT`] data sectors
//! each. Small files are served entirely from the direct slots; the two
//! levels of indirection carry files up to
//! `512 * (123 + 128 * 128)` bytes.
//!
//! A sector opens to at most one in-memory [`Inode`]; re-opening returns
//! the same object with its open count raised. Writes past the current
//! length grow the file first: the extension walk allocates zero-filled
//! data sectors in order, materializing the doubly-indirect block and each
//! indirect block exactly when the first slot inside it is needed, and only
//! then publishes the new length together with the updated index in a
//! single write of the inode record. If any allocation fails mid-walk,
//! every sector taken by that call is released and the record is left as it
//! was.
//!
//! All sector I/O goes through the buffer cache; this module never touches
//! the disk directly.

use super::FileSys;
use crate::{
    dev::{Sector, SECTOR_SIZE},
    sync::SpinLock,
    KernelError,
};
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Identifies an inode record.
pub const INODE_MAGIC: u32 = 0x494e4f44;
/// Number of direct slots in the on-disk inode record. Chosen so that the
/// record is exactly one sector.
pub const DIRECT_N: usize = 123;
/// Number of sector indices held by one index block.
pub const INDIRECT_FANOUT: usize = SECTOR_SIZE / 4;
/// Marker for an unallocated slot in the index.
const NO_SECTOR: i32 = -1;
/// Largest supported file length in bytes.
pub const MAX_LENGTH: usize = SECTOR_SIZE * (DIRECT_N + INDIRECT_FANOUT * INDIRECT_FANOUT);

/// On-disk inode record. Exactly one sector.
#[repr(C)]
#[derive(Clone, AsBytes, FromBytes)]
pub struct InodeDisk {
    /// Sector holding this record.
    pub self_sector: u32,
    /// Bit 0: is-directory. Remaining bits: directory depth.
    pub info: u32,
    /// File length in bytes.
    pub length: i32,
    /// Direct data-sector indices, [`NO_SECTOR`] when unallocated.
    pub direct: [i32; DIRECT_N],
    /// Sector of the doubly-indirect block, [`NO_SECTOR`] when absent.
    pub doubly_indirect: i32,
    /// Must be [`INODE_MAGIC`].
    pub magic: u32,
}
const_assert_eq!(core::mem::size_of::<InodeDisk>(), SECTOR_SIZE);

impl InodeDisk {
    fn empty() -> Self {
        Self {
            self_sector: 0,
            info: 0,
            length: 0,
            direct: [NO_SECTOR; DIRECT_N],
            doubly_indirect: NO_SECTOR,
            magic: 0,
        }
    }
}

/// Pack the directory bit and depth into an `info` field.
pub fn pack_info(is_dir: bool, level: u32) -> u32 {
    (level << 1) | is_dir as u32
}

/// Whether an `info` field marks a directory.
pub fn is_directory(info: u32) -> bool {
    info & 1 != 0
}

/// Directory depth recorded in an `info` field.
pub fn get_level(info: u32) -> u32 {
    info >> 1
}

/// Replace the depth in an `info` field, keeping the directory bit.
pub fn set_level(info: u32, level: u32) -> u32 {
    (level << 1) | (info & 1)
}

fn bytes_to_sectors(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

pub(crate) struct InodeState {
    pub data: InodeDisk,
    pub open_cnt: usize,
    pub removed: bool,
    pub deny_write_cnt: usize,
}

/// In-memory inode.
pub struct Inode {
    sector: Sector,
    pub(crate) state: SpinLock<InodeState>,
}

impl Inode {
    /// Initialize an inode of `length` bytes at `sector`, which the caller
    /// has already reserved in the free map. Data sectors covering `length`
    /// are allocated and zeroed. On failure every sector allocated by this
    /// call is released; the inode sector itself stays with the caller.
    pub fn create(
        fs: &FileSys,
        sector: Sector,
        length: usize,
        info: u32,
    ) -> Result<(), KernelError> {
        let mut data = InodeDisk {
            self_sector: sector.0,
            info,
            length: 0,
            direct: [NO_SECTOR; DIRECT_N],
            doubly_indirect: NO_SECTOR,
            magic: INODE_MAGIC,
        };
        if length > 0 {
            let ext = fs.ext_lock.lock();
            let r = extend(fs, &mut data, length);
            ext.unlock();
            r?;
        }
        fs.cache.write(sector, data.as_bytes(), 0)
    }

    /// Return the in-memory inode for `sector`, reading the record on a
    /// fresh open and raising the open count otherwise.
    pub fn open(fs: &FileSys, sector: Sector) -> Result<Arc<Inode>, KernelError> {
        let mut open = fs.open_inodes.lock();
        if let Some(inode) = open.iter().find(|i| i.sector == sector) {
            let inode = inode.clone();
            let mut state = inode.state.lock();
            state.open_cnt += 1;
            state.unlock();
            open.unlock();
            return Ok(inode);
        }
        let mut data = InodeDisk::empty();
        if let Err(e) = fs.cache.read(sector, data.as_bytes_mut(), 0) {
            open.unlock();
            return Err(e);
        }
        assert_eq!(data.magic, INODE_MAGIC, "inode magic mismatch at {:?}", sector);
        let inode = Arc::new(Inode {
            sector,
            state: SpinLock::new(InodeState {
                data,
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        open.push(inode.clone());
        open.unlock();
        Ok(inode)
    }

    /// Raise the open count of an already-open inode.
    pub fn reopen(self: &Arc<Self>) -> Arc<Inode> {
        let mut state = self.state.lock();
        assert!(state.open_cnt > 0);
        state.open_cnt += 1;
        state.unlock();
        self.clone()
    }

    /// Drop one reference. When the last opener closes a removed inode, its
    /// data sectors, index blocks and the record sector are all released.
    pub fn close(fs: &FileSys, inode: &Arc<Inode>) {
        let mut open = fs.open_inodes.lock();
        let mut state = inode.state.lock();
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            state.unlock();
            open.unlock();
            return;
        }
        open.retain(|i| !Arc::ptr_eq(i, inode));
        let removed = state.removed;
        let data = state.data.clone();
        state.unlock();
        open.unlock();
        if removed {
            release_blocks(fs, &data);
            let mut freemap = fs.freemap.lock();
            freemap.release(inode.sector, 1);
            freemap.unlock();
            let _ = fs.cache.release(inode.sector);
        }
    }

    /// Mark the inode to be deleted when the last opener closes it.
    pub fn remove(&self) {
        let mut state = self.state.lock();
        state.removed = true;
        state.unlock();
    }

    /// Sector of the on-disk record, the inode's identity.
    pub fn inumber(&self) -> Sector {
        self.sector
    }

    /// Current length in bytes.
    pub fn length(&self) -> usize {
        let state = self.state.lock();
        let len = state.data.length.max(0) as usize;
        state.unlock();
        len
    }

    /// The raw `info` field.
    pub fn get_info(&self) -> u32 {
        let state = self.state.lock();
        let info = state.data.info;
        state.unlock();
        info
    }

    /// Whether the inode is a directory.
    pub fn is_directory(&self) -> bool {
        is_directory(self.get_info())
    }

    /// Directory depth of the inode.
    pub fn level(&self) -> u32 {
        get_level(self.get_info())
    }

    /// Number of current openers.
    pub fn open_count(&self) -> usize {
        let state = self.state.lock();
        let n = state.open_cnt;
        state.unlock();
        n
    }

    /// Whether the inode has been marked removed.
    pub fn is_removed(&self) -> bool {
        let state = self.state.lock();
        let r = state.removed;
        state.unlock();
        r
    }

    /// Disable writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.unlock();
    }

    /// Re-enable writes. Must balance a previous [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
        state.unlock();
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`, clamped to
    /// the current length. Returns the number of bytes read; a read at or
    /// past end of file returns 0 without I/O.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> usize {
        let state = self.state.lock();
        let length = state.data.length.max(0) as usize;
        if offset >= length {
            state.unlock();
            return 0;
        }
        let size = buf.len().min(length - offset);
        let mut done = 0;
        while done < size {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(size - done);
            let Some(sector) = byte_to_sector(fs, &state.data, pos / SECTOR_SIZE) else {
                break;
            };
            if fs
                .cache
                .read(sector, &mut buf[done..done + chunk], sector_ofs)
                .is_err()
            {
                break;
            }
            done += chunk;
        }
        state.unlock();
        done
    }

    /// Write `buf.len()` bytes starting at byte `offset`, growing the file
    /// first when the write reaches past the current end. Gap bytes created
    /// by a sparse write read back as zero. Returns the number of bytes
    /// written: 0 when writes are denied or when growth fails.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> usize {
        let mut state = self.state.lock();
        if state.deny_write_cnt > 0 {
            state.unlock();
            return 0;
        }
        let length = state.data.length.max(0) as usize;
        let size = buf.len();
        if offset + size > length {
            let ext = fs.ext_lock.lock();
            let grown = extend(fs, &mut state.data, offset + size);
            ext.unlock();
            if grown.is_err() {
                state.unlock();
                return 0;
            }
            // Publish the new length atomically with the index update.
            if fs
                .cache
                .write(self.sector, state.data.as_bytes(), 0)
                .is_err()
            {
                state.unlock();
                return 0;
            }
        }
        let mut done = 0;
        while done < size {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(size - done);
            let Some(sector) = byte_to_sector(fs, &state.data, pos / SECTOR_SIZE) else {
                break;
            };
            if fs
                .cache
                .write(sector, &buf[done..done + chunk], sector_ofs)
                .is_err()
            {
                break;
            }
            done += chunk;
        }
        state.unlock();
        done
    }

    /// Replace the depth field, persisting the record.
    pub fn write_level(&self, fs: &FileSys, level: u32) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.data.info = set_level(state.data.info, level);
        let r = fs.cache.write(self.sector, state.data.as_bytes(), 0);
        state.unlock();
        r
    }
}

/// Map a sector index within the file to its disk sector, walking the
/// index structure through the cache.
fn byte_to_sector(fs: &FileSys, data: &InodeDisk, idx: usize) -> Option<Sector> {
    let raw = if idx < DIRECT_N {
        data.direct[idx]
    } else {
        let j = idx - DIRECT_N;
        let (i1, i0) = (j / INDIRECT_FANOUT, j % INDIRECT_FANOUT);
        if i1 >= INDIRECT_FANOUT || data.doubly_indirect < 0 {
            return None;
        }
        let indirect = read_index_slot(fs, Sector(data.doubly_indirect as u32), i1)?;
        read_index_slot(fs, indirect, i0).map(|s| s.0 as i32).unwrap_or(NO_SECTOR)
    };
    (raw >= 0).then(|| Sector(raw as u32))
}

fn read_index_slot(fs: &FileSys, block: Sector, slot: usize) -> Option<Sector> {
    let mut raw = [0u8; 4];
    fs.cache.read(block, &mut raw, slot * 4).ok()?;
    let v = i32::from_le_bytes(raw);
    (v >= 0).then(|| Sector(v as u32))
}

fn write_index_slot(fs: &FileSys, block: Sector, slot: usize, v: i32) -> Result<(), KernelError> {
    fs.cache.write(block, &v.to_le_bytes(), slot * 4)
}

/// Reserve one sector and fill it through the cache.
fn alloc_filled(
    fs: &FileSys,
    allocated: &mut Vec<Sector>,
    fill: &[u8; SECTOR_SIZE],
) -> Result<Sector, KernelError> {
    let mut freemap = fs.freemap.lock();
    let Some(s) = freemap.allocate(1) else {
        freemap.unlock();
        return Err(KernelError::NoSpace);
    };
    freemap.unlock();
    allocated.push(s);
    fs.cache.write(s, fill, 0)?;
    Ok(s)
}

/// Grow the index of `data` to cover `new_length` bytes, zero-filling every
/// new data sector. The caller holds the inode-system lock. On failure the
/// record is restored and every sector allocated by this call is released.
fn extend(fs: &FileSys, data: &mut InodeDisk, new_length: usize) -> Result<(), KernelError> {
    let old_length = data.length.max(0) as usize;
    if new_length <= old_length {
        return Ok(());
    }
    if new_length > MAX_LENGTH {
        return Err(KernelError::NoSpace);
    }
    let snapshot = data.clone();
    let mut allocated = Vec::new();
    let zeros = [0u8; SECTOR_SIZE];
    let no_sector_block = {
        let mut block = [0u8; SECTOR_SIZE];
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&NO_SECTOR.to_le_bytes());
        }
        block
    };

    let result = (|| -> Result<(), KernelError> {
        for idx in bytes_to_sectors(old_length)..bytes_to_sectors(new_length) {
            if idx < DIRECT_N {
                let s = alloc_filled(fs, &mut allocated, &zeros)?;
                data.direct[idx] = s.0 as i32;
                continue;
            }
            let j = idx - DIRECT_N;
            let (i1, i0) = (j / INDIRECT_FANOUT, j % INDIRECT_FANOUT);
            if data.doubly_indirect < 0 {
                let d = alloc_filled(fs, &mut allocated, &no_sector_block)?;
                data.doubly_indirect = d.0 as i32;
            }
            let doubly = Sector(data.doubly_indirect as u32);
            let indirect = if i0 == 0 {
                // First slot of a fresh indirect block.
                let ind = alloc_filled(fs, &mut allocated, &no_sector_block)?;
                write_index_slot(fs, doubly, i1, ind.0 as i32)?;
                ind
            } else {
                read_index_slot(fs, doubly, i1).ok_or(KernelError::FilesystemCorrupted(
                    "missing indirect block during growth",
                ))?
            };
            let s = alloc_filled(fs, &mut allocated, &zeros)?;
            write_index_slot(fs, indirect, i0, s.0 as i32)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            data.length = new_length as i32;
            Ok(())
        }
        Err(e) => {
            *data = snapshot;
            let mut freemap = fs.freemap.lock();
            for s in allocated {
                freemap.release(s, 1);
            }
            freemap.unlock();
            Err(e)
        }
    }
}

/// Release every data sector and index block referenced by `data`: the data
/// sectors covered by the length, then each referenced indirect block, then
/// the doubly-indirect block itself.
fn release_blocks(fs: &FileSys, data: &InodeDisk) {
    let sectors = bytes_to_sectors(data.length.max(0) as usize);
    let mut doomed = Vec::new();
    for idx in 0..sectors.min(DIRECT_N) {
        if data.direct[idx] >= 0 {
            doomed.push(Sector(data.direct[idx] as u32));
        }
    }
    if data.doubly_indirect >= 0 {
        let doubly = Sector(data.doubly_indirect as u32);
        let spill = sectors.saturating_sub(DIRECT_N);
        for i1 in 0..spill.div_ceil(INDIRECT_FANOUT) {
            let Some(indirect) = read_index_slot(fs, doubly, i1) else {
                continue;
            };
            let in_this = (spill - i1 * INDIRECT_FANOUT).min(INDIRECT_FANOUT);
            for i0 in 0..in_this {
                if let Some(s) = read_index_slot(fs, indirect, i0) {
                    doomed.push(s);
                }
            }
            doomed.push(indirect);
        }
        doomed.push(doubly);
    }
    let mut freemap = fs.freemap.lock();
    for s in &doomed {
        freemap.release(*s, 1);
    }
    freemap.unlock();
    for s in &doomed {
        let _ = fs.cache.release(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{Disk, MemDisk};

    fn fresh(sectors: usize) -> Arc<FileSys> {
        FileSys::mount(Disk::new(MemDisk::new(sectors)), true).unwrap()
    }

    fn new_inode(fs: &Arc<FileSys>, length: usize) -> Arc<Inode> {
        let sector = {
            let mut freemap = fs.freemap.lock();
            let s = freemap.allocate(1).unwrap();
            freemap.unlock();
            s
        };
        Inode::create(fs, sector, length, pack_info(false, 0)).unwrap();
        Inode::open(fs, sector).unwrap()
    }

    #[test]
    fn info_bits() {
        let dir = pack_info(true, 3);
        assert!(is_directory(dir));
        assert_eq!(get_level(dir), 3);
        let deeper = set_level(dir, 7);
        assert!(is_directory(deeper));
        assert_eq!(get_level(deeper), 7);
        assert!(!is_directory(pack_info(false, 7)));
    }

    #[test]
    fn growth_crosses_the_direct_boundary() {
        let fs = fresh(512);
        let inode = new_inode(&fs, 0);
        // Fill the direct slots exactly: no indirection yet.
        let direct_len = DIRECT_N * SECTOR_SIZE;
        let body = vec![0x42u8; direct_len];
        assert_eq!(inode.write_at(&fs, &body, 0), direct_len);
        {
            let state = inode.state.lock();
            assert!(state.data.direct.iter().all(|&s| s >= 0));
            assert_eq!(state.data.doubly_indirect, NO_SECTOR);
            state.unlock();
        }
        // One more byte forces the doubly-indirect chain alive.
        assert_eq!(inode.write_at(&fs, b"!", direct_len), 1);
        {
            let state = inode.state.lock();
            assert!(state.data.doubly_indirect >= 0);
            state.unlock();
        }
        assert_eq!(inode.length(), direct_len + 1);
        // The byte at the boundary reads back through the indirection.
        let mut one = [0u8; 1];
        assert_eq!(inode.read_at(&fs, &mut one, direct_len), 1);
        assert_eq!(&one, b"!");
        let mut edge = [0u8; 2];
        assert_eq!(inode.read_at(&fs, &mut edge, direct_len - 1), 2);
        assert_eq!(&edge, b"\x42!");
        Inode::close(&fs, &inode);
    }

    #[test]
    fn growth_past_max_length_is_refused() {
        let fs = fresh(64);
        let inode = new_inode(&fs, 0);
        let used = {
            let freemap = fs.freemap.lock();
            let n = freemap.used_count();
            freemap.unlock();
            n
        };
        assert_eq!(inode.write_at(&fs, b"x", MAX_LENGTH), 0);
        assert_eq!(inode.length(), 0);
        let after = {
            let freemap = fs.freemap.lock();
            let n = freemap.used_count();
            freemap.unlock();
            n
        };
        assert_eq!(used, after);
        Inode::close(&fs, &inode);
    }

    #[test]
    fn deny_write_is_counted_per_opener() {
        let fs = fresh(128);
        let inode = new_inode(&fs, 0);
        let again = inode.reopen();
        inode.deny_write();
        again.deny_write();
        assert_eq!(inode.write_at(&fs, b"no", 0), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(&fs, b"no", 0), 0);
        again.allow_write();
        assert_eq!(inode.write_at(&fs, b"ok", 0), 2);
        Inode::close(&fs, &again);
        Inode::close(&fs, &inode);
    }

    #[test]
    fn one_in_memory_inode_per_sector() {
        let fs = fresh(128);
        let inode = new_inode(&fs, 0);
        let sector = inode.inumber();
        let other = Inode::open(&fs, sector).unwrap();
        assert!(Arc::ptr_eq(&inode, &other));
        assert_eq!(inode.open_count(), 2);
        Inode::close(&fs, &other);
        assert_eq!(inode.open_count(), 1);
        Inode::close(&fs, &inode);
    }

    #[test]
    fn removed_blocks_return_only_at_last_close() {
        let fs = fresh(256);
        let inode = new_inode(&fs, 3 * SECTOR_SIZE);
        let used = {
            let freemap = fs.freemap.lock();
            let n = freemap.used_count();
            freemap.unlock();
            n
        };
        let again = inode.reopen();
        inode.remove();
        Inode::close(&fs, &again);
        let while_open = {
            let freemap = fs.freemap.lock();
            let n = freemap.used_count();
            freemap.unlock();
            n
        };
        assert_eq!(used, while_open);
        Inode::close(&fs, &inode);
        let after = {
            let freemap = fs.freemap.lock();
            let n = freemap.used_count();
            freemap.unlock();
            n
        };
        // Three data sectors and the record sector came back.
        assert_eq!(after + 4, used);
    }
}
