//! File Allocation Table access and cluster chains
//!
//! Entry encodings:
//! - FAT12: 12 bits, two entries packed into three bytes at byte offset
//!   `n + n / 2`; even entries use the low 12 bits of the 16-bit word, odd
//!   entries the high 12. An entry may straddle two sectors.
//! - FAT16: little-endian word at `n * 2`.
//! - FAT32: little-endian dword at `n * 4`, low 28 bits significant. The top
//!   four bits are preserved on every write.
//!
//! Entries 0 and 1 are reserved and never read or written through here.

use alloc::vec;
use alloc::vec::Vec;
use crate::io::block::{BlockDevice, Disk};
use super::bpb::{cluster_values, FatType, VolumeParameters};
use super::cache::FatCache;
use super::error::{FatError, Result};
use super::{le16, le32, put16, put32};

/// A run of physically consecutive clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub first: u32,
    pub count: u32,
}

/// The FAT of one volume, seen through its sector cache.
///
/// Borrowing the cache mutably means the holder has the cache lock.
pub struct FatTable<'a, D: BlockDevice> {
    params: &'a VolumeParameters,
    disk: &'a Disk<D>,
    cache: &'a mut FatCache,
}

impl<'a, D: BlockDevice> FatTable<'a, D> {
    pub fn new(params: &'a VolumeParameters, disk: &'a Disk<D>, cache: &'a mut FatCache) -> Self {
        Self { params, disk, cache }
    }

    pub fn params(&self) -> &VolumeParameters {
        self.params
    }

    fn check_entry(&self, n: u32) -> Result<()> {
        if !self.params.is_valid_cluster(n) {
            return Err(FatError::Structural("FAT entry number out of range"));
        }
        Ok(())
    }

    /// Sector within the FAT and byte offset within that sector
    fn locate(&self, byte_offset: u32) -> (u32, usize) {
        let bps = self.params.bytes_per_sector;
        (byte_offset / bps, (byte_offset % bps) as usize)
    }

    /// Read FAT entry `n`
    pub fn get_entry(&mut self, n: u32) -> Result<u32> {
        self.check_entry(n)?;

        match self.params.fs_type {
            FatType::Fat12 => {
                let (sector, off) = self.locate(n + n / 2);
                let lo;
                let hi;
                {
                    let data = self.cache.sector(self.disk, sector)?;
                    lo = data[off];
                    hi = if off + 1 < data.len() { Some(data[off + 1]) } else { None };
                }
                let hi = match hi {
                    Some(byte) => byte,
                    None => self.cache.sector(self.disk, sector + 1)?[0],
                };
                let word = u16::from_le_bytes([lo, hi]) as u32;
                Ok(if n & 1 == 0 { word & 0x0FFF } else { word >> 4 })
            }
            FatType::Fat16 => {
                let (sector, off) = self.locate(n * 2);
                let data = self.cache.sector(self.disk, sector)?;
                Ok(le16(data, off) as u32)
            }
            FatType::Fat32 => {
                let (sector, off) = self.locate(n * 4);
                let data = self.cache.sector(self.disk, sector)?;
                Ok(le32(data, off) & cluster_values::CLUSTER_MASK)
            }
        }
    }

    /// Write FAT entry `n`. The value is masked to the entry width.
    pub fn set_entry(&mut self, n: u32, value: u32) -> Result<()> {
        self.check_entry(n)?;
        let value = value & self.params.fs_type.entry_mask();

        match self.params.fs_type {
            FatType::Fat12 => {
                let (sector, off) = self.locate(n + n / 2);
                let straddles = off + 1 >= self.params.bytes_per_sector as usize;

                let old_lo = self.cache.sector(self.disk, sector)?[off];
                let old_hi = if straddles {
                    self.cache.sector(self.disk, sector + 1)?[0]
                } else {
                    self.cache.sector(self.disk, sector)?[off + 1]
                };
                let old = u16::from_le_bytes([old_lo, old_hi]);

                let new = if n & 1 == 0 {
                    (old & 0xF000) | (value as u16 & 0x0FFF)
                } else {
                    (old & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                };
                let [lo, hi] = new.to_le_bytes();

                self.cache.sector_mut(self.disk, sector)?[off] = lo;
                if straddles {
                    if let Err(err) = self.cache.sector_mut(self.disk, sector + 1).map(|data| data[0] = hi) {
                        // Never leave half an entry behind. A failed eviction
                        // keeps `sector` cached, so this does no I/O.
                        if let Ok(data) = self.cache.sector_mut(self.disk, sector) {
                            data[off] = old_lo;
                        }
                        return Err(err);
                    }
                } else {
                    self.cache.sector_mut(self.disk, sector)?[off + 1] = hi;
                }
            }
            FatType::Fat16 => {
                let (sector, off) = self.locate(n * 2);
                let data = self.cache.sector_mut(self.disk, sector)?;
                put16(data, off, value as u16);
            }
            FatType::Fat32 => {
                let (sector, off) = self.locate(n * 4);
                let data = self.cache.sector_mut(self.disk, sector)?;
                let new = (le32(data, off) & cluster_values::FAT32_RESERVED_BITS) | value;
                put32(data, off, new);
            }
        }
        Ok(())
    }

    /// Follow one link of a chain. `None` at the end of the chain.
    pub fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>> {
        let next = self.get_entry(cluster)?;
        if self.params.is_terminal(next) {
            return Ok(None);
        }
        if !self.params.is_valid_cluster(next) {
            return Err(FatError::Structural("cluster chain links outside the data area"));
        }
        Ok(Some(next))
    }

    /// Walk a chain, calling `visit` for every cluster in order. A start
    /// cluster of 0 is an empty chain.
    fn walk(&mut self, start: u32, mut visit: impl FnMut(u32) -> bool) -> Result<u32> {
        if start == 0 {
            return Ok(0);
        }
        if !self.params.is_valid_cluster(start) {
            return Err(FatError::Structural("chain starts outside the data area"));
        }

        let mut cluster = start;
        let mut count = 0u32;
        loop {
            count += 1;
            if count > self.params.data_clusters {
                return Err(FatError::Structural("cluster chain loops"));
            }
            if !visit(cluster) {
                return Ok(count);
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(count),
            }
        }
    }

    /// Number of clusters in a chain
    pub fn num_clusters(&mut self, start: u32) -> Result<u32> {
        self.walk(start, |_| true)
    }

    /// Last cluster of a chain, 0 for an empty chain
    pub fn last_cluster(&mut self, start: u32) -> Result<u32> {
        let mut last = 0;
        self.walk(start, |c| {
            last = c;
            true
        })?;
        Ok(last)
    }

    /// Cluster number `n` (0-based) of a chain
    pub fn nth_cluster(&mut self, start: u32, n: u32) -> Result<u32> {
        let mut found = None;
        let mut index = 0;
        self.walk(start, |c| {
            if index == n {
                found = Some(c);
                return false;
            }
            index += 1;
            true
        })?;
        found.ok_or(FatError::Structural("cluster chain shorter than expected"))
    }

    /// Every cluster of a chain, in order
    pub fn chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        self.walk(start, |c| {
            clusters.push(c);
            true
        })?;
        Ok(clusters)
    }

    /// Map `count` clusters of a chain, after skipping `skip`, onto runs of
    /// physically consecutive clusters
    pub fn extents(&mut self, start: u32, skip: u32, count: u32) -> Result<Vec<Extent>> {
        let mut extents: Vec<Extent> = Vec::new();
        if count == 0 {
            return Ok(extents);
        }

        let mut index = 0u32;
        let mut taken = 0u32;
        self.walk(start, |c| {
            if index >= skip {
                match extents.last_mut() {
                    Some(run) if run.first + run.count == c => run.count += 1,
                    _ => extents.push(Extent { first: c, count: 1 }),
                }
                taken += 1;
            }
            index += 1;
            taken < count
        })?;

        if taken < count {
            return Err(FatError::Structural("cluster chain shorter than expected"));
        }
        Ok(extents)
    }
}

/// Largest transfer issued for one extent, in clusters
const MAX_TRANSFER_CLUSTERS: u32 = 64;

fn transfer_pieces(extent: Extent) -> impl Iterator<Item = (u32, u32)> {
    let end = extent.first + extent.count;
    (extent.first..end)
        .step_by(MAX_TRANSFER_CLUSTERS as usize)
        .map(move |first| (first, (end - first).min(MAX_TRANSFER_CLUSTERS)))
}

/// Read cluster data for a list of extents into `buf`, one multi-sector
/// transfer per run
pub fn read_extents<D: BlockDevice>(
    disk: &Disk<D>,
    params: &VolumeParameters,
    extents: &[Extent],
    buf: &mut [u8],
) -> Result<()> {
    let cluster_size = params.cluster_size() as usize;
    let mut offset = 0usize;

    for &extent in extents {
        for (first, count) in transfer_pieces(extent) {
            let len = count as usize * cluster_size;
            let sectors = count * params.sectors_per_cluster;
            disk.read(params.cluster_to_sector(first), sectors, &mut buf[offset..offset + len])?;
            offset += len;
        }
    }
    Ok(())
}

/// Write cluster data for a list of extents from `buf`
pub fn write_extents<D: BlockDevice>(
    disk: &Disk<D>,
    params: &VolumeParameters,
    extents: &[Extent],
    buf: &[u8],
) -> Result<()> {
    let cluster_size = params.cluster_size() as usize;
    let mut offset = 0usize;

    for &extent in extents {
        for (first, count) in transfer_pieces(extent) {
            let len = count as usize * cluster_size;
            let sectors = count * params.sectors_per_cluster;
            disk.write(params.cluster_to_sector(first), sectors, &buf[offset..offset + len])?;
            offset += len;
        }
    }
    Ok(())
}

/// Zero the data of every cluster in a list of extents
pub fn clear_extents<D: BlockDevice>(
    disk: &Disk<D>,
    params: &VolumeParameters,
    extents: &[Extent],
) -> Result<()> {
    let longest = extents
        .iter()
        .map(|e| e.count.min(MAX_TRANSFER_CLUSTERS))
        .max()
        .unwrap_or(0);
    let zeros = vec![0u8; longest as usize * params.cluster_size() as usize];

    for &extent in extents {
        for (first, count) in transfer_pieces(extent) {
            let len = count as usize * params.cluster_size() as usize;
            let sectors = count * params.sectors_per_cluster;
            disk.write(params.cluster_to_sector(first), sectors, &zeros[..len])?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::fat::bpb::tests::{fat32_boot_sector, small_boot_sector};
    use crate::io::ramdisk::RamDisk;

    pub(crate) fn volume(sector: &[u8], total: u64) -> (Disk<RamDisk>, VolumeParameters) {
        let params = VolumeParameters::parse(sector, 512).unwrap();
        let mut ram = RamDisk::new(total, 512);
        ram.data_mut()[..512].copy_from_slice(sector);
        (Disk::new(ram), params)
    }

    pub(crate) fn fat12() -> (Disk<RamDisk>, VolumeParameters) {
        volume(&small_boot_sector(1, 224, 12, 2000), 2000)
    }

    pub(crate) fn fat16() -> (Disk<RamDisk>, VolumeParameters) {
        volume(&small_boot_sector(1, 224, 20, 5000), 5000)
    }

    pub(crate) fn fat32() -> (Disk<RamDisk>, VolumeParameters) {
        volume(&fat32_boot_sector(512, 66581), 66581)
    }

    #[test]
    fn test_entry_round_trip_all_types() {
        for (disk, params) in [fat12(), fat16(), fat32()] {
            let mut cache = FatCache::new(&params, 8);
            let mut fat = FatTable::new(&params, &disk, &mut cache);
            let mask = params.fs_type.entry_mask();
            let max = params.max_cluster();

            for n in [2, 3, 4, 5, max / 2, max - 1, max] {
                let value = (n.wrapping_mul(2654435761)) & mask;
                fat.set_entry(n, value).unwrap();
                assert_eq!(fat.get_entry(n).unwrap(), value, "{:?} entry {}", params.fs_type, n);
            }
            // Neighbours of packed FAT12 entries survive
            fat.set_entry(10, 0xABC).unwrap();
            fat.set_entry(11, 0x123).unwrap();
            assert_eq!(fat.get_entry(10).unwrap(), 0xABC & mask);
            assert_eq!(fat.get_entry(11).unwrap(), 0x123 & mask);
        }
    }

    #[test]
    fn test_fat12_straddling_entry() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 1);
        let mut fat = FatTable::new(&params, &disk, &mut cache);

        // Entry 341 starts at byte 511 and ends in the next sector
        fat.set_entry(340, 0x0FF8).unwrap();
        fat.set_entry(341, 0x0A5C).unwrap();
        fat.set_entry(342, 0x0123).unwrap();
        assert_eq!(fat.get_entry(341).unwrap(), 0x0A5C);
        assert_eq!(fat.get_entry(340).unwrap(), 0x0FF8);
        assert_eq!(fat.get_entry(342).unwrap(), 0x0123);

        cache.flush(&disk).unwrap();
        let dev = disk.device();
        assert_eq!(dev.data()[512 + 511] >> 4, 0xC);
        assert_eq!(dev.data()[1024], 0xA5);
    }

    #[test]
    fn test_fat32_top_bits_preserved() {
        let (disk, params) = fat32();
        {
            let mut dev = disk.device();
            let off = 32 * 512 + 7 * 4;
            dev.data_mut()[off + 3] = 0xA0;
        }
        let mut cache = FatCache::new(&params, 4);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        fat.set_entry(7, 0x0123_4567).unwrap();
        fat.set_entry(8, 0x0FFF_FFFF).unwrap();
        assert_eq!(fat.get_entry(7).unwrap(), 0x0123_4567);

        cache.flush(&disk).unwrap();
        let dev = disk.device();
        let off = 32 * 512 + 7 * 4;
        assert_eq!(dev.data()[off + 3], 0xA1);
    }

    #[test]
    fn test_reserved_entries_rejected() {
        let (disk, params) = fat16();
        let mut cache = FatCache::new(&params, 4);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        assert!(matches!(fat.get_entry(0), Err(FatError::Structural(_))));
        assert!(matches!(fat.set_entry(1, 5), Err(FatError::Structural(_))));
        assert!(fat.get_entry(params.max_cluster() + 1).is_err());
    }

    #[test]
    fn test_chain_walk_and_extents() {
        let (disk, params) = fat16();
        let mut cache = FatCache::new(&params, 4);
        let mut fat = FatTable::new(&params, &disk, &mut cache);

        // 5 -> 6 -> 7 -> 20 -> 21 -> end
        for (c, next) in [(5, 6), (6, 7), (7, 20), (20, 21), (21, 0xFFFF)] {
            fat.set_entry(c, next).unwrap();
        }
        assert_eq!(fat.num_clusters(0).unwrap(), 0);
        assert_eq!(fat.last_cluster(0).unwrap(), 0);
        assert_eq!(fat.num_clusters(5).unwrap(), 5);
        assert_eq!(fat.last_cluster(5).unwrap(), 21);
        assert_eq!(fat.nth_cluster(5, 3).unwrap(), 20);
        assert!(fat.nth_cluster(5, 5).is_err());

        let extents = fat.extents(5, 1, 3).unwrap();
        assert_eq!(extents, [Extent { first: 6, count: 2 }, Extent { first: 20, count: 1 }]);
        assert!(fat.extents(5, 2, 4).is_err());
        assert!(fat.num_clusters(1).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 4);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        fat.set_entry(2, 3).unwrap();
        fat.set_entry(3, 2).unwrap();
        assert!(matches!(fat.num_clusters(2), Err(FatError::Structural(_))));
    }

    #[test]
    fn test_extent_io_batches_transfers() {
        let (disk, params) = fat16();
        let extents = [Extent { first: 2, count: 3 }, Extent { first: 9, count: 1 }];
        let data: Vec<u8> = (0..4 * 512).map(|i| (i % 251) as u8).collect();

        disk.reset_stats();
        write_extents(&disk, &params, &extents, &data).unwrap();
        assert_eq!(disk.stats().writes, 2);

        let mut back = vec![0u8; data.len()];
        read_extents(&disk, &params, &extents, &mut back).unwrap();
        assert_eq!(back, data);

        clear_extents(&disk, &params, &extents[..1]).unwrap();
        read_extents(&disk, &params, &extents, &mut back).unwrap();
        assert!(back[..3 * 512].iter().all(|&b| b == 0));
        assert_eq!(&back[3 * 512..], &data[3 * 512..]);
    }
}
