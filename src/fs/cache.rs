//! Write-back buffer cache.
//!
//! Every sector the file system touches travels through this cache; the
//! inode layer and the free map never issue device I/O themselves. The
//! cache holds [`CACHE_SIZE`] sector-sized slots and evicts with a clock
//! hand: an unallocated slot is always preferred, otherwise the hand sweeps
//! the slots clearing accessed marks until it finds a cold one. Dirty
//! victims are written back before the slot is reused, so no modification
//! is ever lost to eviction.
//!
//! Writes only touch the in-memory slot and set the dirty mark; the slot
//! becomes the authoritative copy of its sector until it is flushed. The
//! write-behind thread calls [`BufferCache::flush_all`] periodically, and
//! the cache is flushed once more at shutdown. `flush_all` deliberately
//! leaves the dirty mark set: a re-flush of a still-dirty slot is
//! idempotent, and clearing the mark could lose a write racing with the
//! flush.
//!
//! One spinlock serializes the whole cache, index and slot contents alike.
//! That is the simplest arrangement preserving the two cache invariants: at
//! most one allocated slot per sector, and no torn reads during eviction.

use crate::{
    dev::{Disk, Sector, SECTOR_SIZE},
    sync::SpinLock,
    KernelError,
};

/// Number of slots in the buffer cache.
pub const CACHE_SIZE: usize = 64;

struct Slot {
    sector: Sector,
    allocated: bool,
    accessed: bool,
    dirty: bool,
    data: Box<[u8; SECTOR_SIZE]>,
}

struct CacheState {
    slots: Vec<Slot>,
    hand: usize,
}

/// The sector cache in front of the file-system disk.
pub struct BufferCache {
    disk: Disk,
    state: SpinLock<CacheState>,
}

impl BufferCache {
    /// Create a cache over `disk` with all slots unallocated.
    pub fn new(disk: Disk) -> Self {
        let slots = (0..CACHE_SIZE)
            .map(|_| Slot {
                sector: Sector(0),
                allocated: false,
                accessed: false,
                dirty: false,
                data: Box::new([0u8; SECTOR_SIZE]),
            })
            .collect();
        Self {
            disk,
            state: SpinLock::new(CacheState { slots, hand: 0 }),
        }
    }

    fn find(state: &CacheState, sector: Sector) -> Option<usize> {
        state
            .slots
            .iter()
            .position(|s| s.allocated && s.sector == sector)
    }

    /// Select a slot for reuse: any unallocated slot first, otherwise run
    /// the clock hand, clearing accessed marks, until a cold slot is found.
    /// The victim is flushed if dirty and returned unallocated.
    fn evict(&self, state: &mut CacheState) -> Result<usize, KernelError> {
        if let Some(i) = state.slots.iter().position(|s| !s.allocated) {
            return Ok(i);
        }
        loop {
            let i = state.hand;
            state.hand = (state.hand + 1) % CACHE_SIZE;
            let slot = &mut state.slots[i];
            if slot.accessed {
                slot.accessed = false;
            } else {
                if slot.dirty {
                    self.disk.write(slot.sector, &slot.data)?;
                    slot.dirty = false;
                }
                slot.allocated = false;
                return Ok(i);
            }
        }
    }

    /// Return the index of an allocated slot holding `sector`, loading it
    /// from disk into a victim slot on a miss.
    fn slot_for(&self, state: &mut CacheState, sector: Sector) -> Result<usize, KernelError> {
        if let Some(i) = Self::find(state, sector) {
            return Ok(i);
        }
        let i = self.evict(state)?;
        let slot = &mut state.slots[i];
        self.disk.read(sector, &mut slot.data)?;
        debug_assert!(Self::find(state, sector).is_none());
        let slot = &mut state.slots[i];
        slot.sector = sector;
        slot.allocated = true;
        slot.accessed = true;
        slot.dirty = false;
        Ok(i)
    }

    /// Read `buf.len()` bytes of `sector` starting at byte `ofs` within the
    /// sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8], ofs: usize) -> Result<(), KernelError> {
        assert!(ofs + buf.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let i = match self.slot_for(&mut state, sector) {
            Ok(i) => i,
            Err(e) => {
                state.unlock();
                return Err(e);
            }
        };
        let slot = &mut state.slots[i];
        buf.copy_from_slice(&slot.data[ofs..ofs + buf.len()]);
        slot.accessed = true;
        state.unlock();
        Ok(())
    }

    /// Write `buf.len()` bytes into `sector` starting at byte `ofs` within
    /// the sector. The slot is marked dirty; the disk is not touched.
    pub fn write(&self, sector: Sector, buf: &[u8], ofs: usize) -> Result<(), KernelError> {
        assert!(ofs + buf.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let i = match self.slot_for(&mut state, sector) {
            Ok(i) => i,
            Err(e) => {
                state.unlock();
                return Err(e);
            }
        };
        let slot = &mut state.slots[i];
        slot.data[ofs..ofs + buf.len()].copy_from_slice(buf);
        slot.accessed = true;
        slot.dirty = true;
        state.unlock();
        Ok(())
    }

    /// Invalidate the slot holding `sector`, flushing it first if dirty.
    ///
    /// Called when the file system frees a sector, so a later reuse of the
    /// sector never observes stale cache contents. Returns whether a slot
    /// was present.
    pub fn release(&self, sector: Sector) -> Result<bool, KernelError> {
        let mut state = self.state.lock();
        let Some(i) = Self::find(&state, sector) else {
            state.unlock();
            return Ok(false);
        };
        let slot = &mut state.slots[i];
        if slot.dirty {
            if let Err(e) = self.disk.write(slot.sector, &slot.data) {
                state.unlock();
                return Err(e);
            }
            let slot = &mut state.slots[i];
            slot.dirty = false;
        }
        state.slots[i].allocated = false;
        state.unlock();
        Ok(true)
    }

    /// Write every allocated dirty slot back to disk.
    ///
    /// The dirty marks stay set in memory, so a write racing with the flush
    /// is simply flushed again next period.
    pub fn flush_all(&self) -> Result<(), KernelError> {
        let state = self.state.lock();
        let mut result = Ok(());
        for slot in state.slots.iter().filter(|s| s.allocated && s.dirty) {
            if let Err(e) = self.disk.write(slot.sector, &slot.data) {
                result = Err(e);
            }
        }
        state.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;

    fn cache(sectors: usize) -> BufferCache {
        BufferCache::new(Disk::new(MemDisk::new(sectors)))
    }

    #[test]
    fn read_write_offsets() {
        let c = cache(8);
        c.write(Sector(1), b"hello", 100).unwrap();
        let mut out = [0u8; 5];
        c.read(Sector(1), &mut out, 100).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn eviction_preserves_data() {
        // Touch more sectors than the cache has slots; every pattern must
        // survive eviction via write-back.
        let c = cache(CACHE_SIZE + 16);
        for i in 0..CACHE_SIZE + 6 {
            let byte = i as u8;
            c.write(Sector(i as u32), &[byte; SECTOR_SIZE], 0).unwrap();
        }
        for i in 0..CACHE_SIZE + 6 {
            let mut out = [0u8; SECTOR_SIZE];
            c.read(Sector(i as u32), &mut out, 0).unwrap();
            assert_eq!(out, [i as u8; SECTOR_SIZE], "sector {}", i);
        }
    }

    #[test]
    fn unique_slot_per_sector() {
        let c = cache(8);
        c.write(Sector(2), &[1u8; 4], 0).unwrap();
        c.write(Sector(2), &[2u8; 4], 0).unwrap();
        let state = c.state.lock();
        let n = state
            .slots
            .iter()
            .filter(|s| s.allocated && s.sector == Sector(2))
            .count();
        state.unlock();
        assert_eq!(n, 1);
    }

    #[test]
    fn release_flushes_dirty() {
        let disk = Disk::new(MemDisk::new(8));
        let c = BufferCache::new(disk.clone());
        c.write(Sector(5), &[7u8; SECTOR_SIZE], 0).unwrap();
        assert!(c.release(Sector(5)).unwrap());
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(5), &mut out).unwrap();
        assert_eq!(out, [7u8; SECTOR_SIZE]);
        assert!(!c.release(Sector(5)).unwrap());
    }

    #[test]
    fn flush_all_keeps_dirty_mark() {
        let disk = Disk::new(MemDisk::new(8));
        let c = BufferCache::new(disk.clone());
        c.write(Sector(0), &[9u8; SECTOR_SIZE], 0).unwrap();
        c.flush_all().unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(0), &mut out).unwrap();
        assert_eq!(out, [9u8; SECTOR_SIZE]);
        // A second flush after another write must also land.
        c.write(Sector(0), &[3u8; 1], 0).unwrap();
        c.flush_all().unwrap();
        disk.read(Sector(0), &mut out).unwrap();
        assert_eq!(out[0], 3);
    }
}
