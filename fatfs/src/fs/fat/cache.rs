//! FAT sector cache
//!
//! Keeps a bounded number of FAT sectors in memory. A miss evicts the least
//! recently used slot; a dirty victim is written back to every FAT copy
//! before its slot is reused. Sector numbers here are relative to the start
//! of FAT copy 0.

use alloc::vec;
use alloc::vec::Vec;
use crate::io::block::{BlockDevice, Disk};
use super::bpb::VolumeParameters;
use super::error::{FatError, Result};

/// One cached FAT sector
pub struct CachedFatSector {
    /// Sector number within the FAT
    pub index: u32,
    pub data: Vec<u8>,
    pub dirty: bool,
    /// Value of the access clock at the last hit
    pub last_access: u64,
}

/// LRU cache of FAT sectors for one volume
pub struct FatCache {
    slots: Vec<CachedFatSector>,
    capacity: usize,
    /// Monotonic access clock
    clock: u64,
    /// Slot of the most recent hit
    last_hit: usize,
    fat_start: u64,
    fat_sectors: u32,
    copies: u32,
    sector_size: usize,
}

impl FatCache {
    pub fn new(params: &VolumeParameters, capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            clock: 0,
            last_hit: 0,
            fat_start: params.first_fat_sector() as u64,
            fat_sectors: params.fat_sectors,
            copies: params.number_of_fats,
            sector_size: params.bytes_per_sector as usize,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sectors currently cached
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.slots.iter().any(|s| s.index == index)
    }

    /// Drop every slot. Dirty data is lost.
    pub fn clear(&mut self) {
        self.slots = Vec::new();
        self.last_hit = 0;
    }

    /// Fill the cache with the first sectors of the FAT
    pub fn preload<D: BlockDevice>(&mut self, disk: &Disk<D>) -> Result<()> {
        let count = (self.fat_sectors as usize).min(self.capacity);
        if count == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; count * self.sector_size];
        disk.read(self.fat_start, count as u32, &mut buf)?;

        self.slots.clear();
        for (index, chunk) in buf.chunks(self.sector_size).enumerate() {
            self.clock += 1;
            self.slots.push(CachedFatSector {
                index: index as u32,
                data: chunk.to_vec(),
                dirty: false,
                last_access: self.clock,
            });
        }
        log::debug!(target: "fatfs", "preloaded {} FAT sectors", count);
        Ok(())
    }

    /// Read access to a FAT sector, loading it on a miss
    pub fn sector<D: BlockDevice>(&mut self, disk: &Disk<D>, index: u32) -> Result<&[u8]> {
        let slot = self.load(disk, index)?;
        Ok(&self.slots[slot].data)
    }

    /// Write access to a FAT sector. The sector is marked dirty.
    pub fn sector_mut<D: BlockDevice>(&mut self, disk: &Disk<D>, index: u32) -> Result<&mut [u8]> {
        let slot = self.load(disk, index)?;
        let entry = &mut self.slots[slot];
        entry.dirty = true;
        Ok(&mut entry.data)
    }

    /// Flag a cached sector for write-back. Returns false if not cached.
    pub fn mark_dirty(&mut self, index: u32) -> bool {
        match self.slots.iter_mut().find(|s| s.index == index) {
            Some(slot) => {
                slot.dirty = true;
                true
            }
            None => false,
        }
    }

    fn find(&mut self, index: u32) -> Option<usize> {
        if let Some(slot) = self.slots.get(self.last_hit) {
            if slot.index == index {
                return Some(self.last_hit);
            }
        }
        self.slots.iter().position(|s| s.index == index)
    }

    fn load<D: BlockDevice>(&mut self, disk: &Disk<D>, index: u32) -> Result<usize> {
        if index >= self.fat_sectors {
            return Err(FatError::Structural("FAT sector beyond the end of the FAT"));
        }

        self.clock += 1;
        if let Some(slot) = self.find(index) {
            self.slots[slot].last_access = self.clock;
            self.last_hit = slot;
            return Ok(slot);
        }

        let mut data = vec![0u8; self.sector_size];

        if self.slots.len() < self.capacity {
            disk.read(self.fat_start + index as u64, 1, &mut data)?;
            self.slots.push(CachedFatSector {
                index,
                data,
                dirty: false,
                last_access: self.clock,
            });
            self.last_hit = self.slots.len() - 1;
            return Ok(self.last_hit);
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_access)
            .map(|(i, _)| i)
            .ok_or(FatError::Structural("FAT cache has no slots"))?;

        if self.slots[victim].dirty {
            log::debug!(
                target: "fatfs",
                "evicting dirty FAT sector {}",
                self.slots[victim].index
            );
            self.write_sector(disk, victim)?;
            self.slots[victim].dirty = false;
        }

        disk.read(self.fat_start + index as u64, 1, &mut data)?;

        let slot = &mut self.slots[victim];
        slot.index = index;
        slot.data = data;
        slot.dirty = false;
        slot.last_access = self.clock;
        self.last_hit = victim;
        Ok(victim)
    }

    /// Write one slot to every FAT copy.
    ///
    /// A failing copy does not stop the remaining copies; the first failure
    /// is returned.
    fn write_sector<D: BlockDevice>(&self, disk: &Disk<D>, slot: usize) -> Result<()> {
        let sector = &self.slots[slot];
        let mut first_error = None;

        for copy in 0..self.copies {
            let lba = self.fat_start + (self.fat_sectors as u64 * copy as u64) + sector.index as u64;
            if let Err(status) = disk.write(lba, 1, &sector.data) {
                log::error!(
                    target: "fatfs",
                    "writing FAT sector {} (copy {}) failed: {}",
                    sector.index,
                    copy,
                    status.as_str()
                );
                first_error.get_or_insert(FatError::Io(status));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Write every dirty sector to every FAT copy, lowest sector first.
    ///
    /// All dirty sectors are attempted; the operation fails if any write
    /// failed. Sectors that could not be written stay dirty.
    pub fn flush<D: BlockDevice>(&mut self, disk: &Disk<D>) -> Result<()> {
        let mut dirty: Vec<usize> = (0..self.slots.len()).filter(|&i| self.slots[i].dirty).collect();
        dirty.sort_by_key(|&i| self.slots[i].index);

        let mut first_error = None;
        for slot in dirty {
            match self.write_sector(disk, slot) {
                Ok(()) => self.slots[slot].dirty = false,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::bpb::tests::small_boot_sector;
    use crate::io::ramdisk::RamDisk;

    // 1 reserved sector, two FATs of 12 sectors
    fn setup() -> (Disk<RamDisk>, VolumeParameters) {
        let sector = small_boot_sector(1, 224, 12, 2000);
        let params = VolumeParameters::parse(&sector, 512).unwrap();
        let mut ram = RamDisk::new(2000, 512);
        ram.data_mut()[..512].copy_from_slice(&sector);
        for i in 0..12u32 {
            let off = (1 + i as usize) * 512;
            ram.data_mut()[off] = i as u8;
        }
        (Disk::new(ram), params)
    }

    #[test]
    fn test_preload_and_hit() {
        let (disk, params) = setup();
        let mut cache = FatCache::new(&params, 4);
        cache.preload(&disk).unwrap();
        assert_eq!(cache.len(), 4);

        disk.reset_stats();
        assert_eq!(cache.sector(&disk, 2).unwrap()[0], 2);
        assert_eq!(disk.stats().reads, 0);
    }

    #[test]
    fn test_lru_eviction_writes_back_to_all_copies() {
        let (disk, params) = setup();
        let mut cache = FatCache::new(&params, 2);
        cache.preload(&disk).unwrap();

        cache.sector_mut(&disk, 0).unwrap()[1] = 0xAB;
        cache.sector(&disk, 1).unwrap();

        // Sector 0 is now the least recently used and dirty
        assert_eq!(cache.sector(&disk, 5).unwrap()[0], 5);
        assert!(!cache.contains(0));
        assert!(cache.contains(1));

        let dev = disk.device();
        assert_eq!(dev.data()[512 + 1], 0xAB);
        assert_eq!(dev.data()[(1 + 12) * 512 + 1], 0xAB);
    }

    #[test]
    fn test_failed_writeback_keeps_cache() {
        let (disk, params) = setup();
        let mut cache = FatCache::new(&params, 1);
        cache.sector_mut(&disk, 3).unwrap()[0] = 0x77;

        disk.device().fail_writes_at(Some(1 + 3));
        assert!(cache.sector(&disk, 4).is_err());
        assert!(cache.contains(3));
        assert_eq!(cache.dirty_count(), 1);

        disk.device().fail_writes_at(None);
        assert_eq!(cache.sector(&disk, 4).unwrap()[0], 4);
        assert_eq!(disk.device().data()[4 * 512], 0x77);
    }

    #[test]
    fn test_flush_sorted_and_best_effort() {
        let (disk, params) = setup();
        let mut cache = FatCache::new(&params, 8);
        cache.preload(&disk).unwrap();
        for index in [6u32, 2, 4] {
            cache.sector_mut(&disk, index).unwrap()[2] = 0x11;
        }

        // Copy 1 of sector 2 fails; everything else still lands
        disk.device().fail_writes_at(Some(1 + 12 + 2));
        assert!(cache.flush(&disk).is_err());
        assert_eq!(cache.dirty_count(), 1);

        let dev = disk.device();
        assert_eq!(dev.data()[(1 + 2) * 512 + 2], 0x11);
        assert_eq!(dev.data()[(1 + 4) * 512 + 2], 0x11);
        assert_eq!(dev.data()[(1 + 12 + 6) * 512 + 2], 0x11);
        drop(dev);

        disk.device().fail_writes_at(None);
        assert!(cache.flush(&disk).is_ok());
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_sector_beyond_fat() {
        let (disk, params) = setup();
        let mut cache = FatCache::new(&params, 2);
        assert!(matches!(cache.sector(&disk, 12), Err(FatError::Structural(_))));
    }
}
