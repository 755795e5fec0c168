//! RAM Disk Driver
//!
//! An in-memory block device. Used to build scratch volumes and to drive
//! the FAT driver in tests.
//!
//! # Features
//! - Any legal sector size
//! - Optional removable-media behaviour with a settable disk-changed line
//! - Fault injection on a chosen LBA for reads and writes

use alloc::vec;
use alloc::vec::Vec;
use super::block::{BlockDevice, BlockFlags, BlockStatus, DiskGeometry};

/// RAM disk instance
pub struct RamDisk {
    /// Backing store, `sector_count * sector_size` bytes
    data: Vec<u8>,
    /// Bytes per sector
    sector_size: u32,
    /// Device flags
    flags: BlockFlags,
    /// Disk-changed line
    changed: bool,
    /// Fail reads touching this sector
    fail_read_lba: Option<u64>,
    /// Fail writes touching this sector
    fail_write_lba: Option<u64>,
}

impl RamDisk {
    /// Create a zero-filled fixed disk
    pub fn new(sector_count: u64, sector_size: u32) -> Self {
        Self {
            data: vec![0u8; (sector_count * sector_size as u64) as usize],
            sector_size,
            flags: BlockFlags::empty(),
            changed: false,
            fail_read_lba: None,
            fail_write_lba: None,
        }
    }

    /// Mark the device as removable media
    pub fn removable(mut self) -> Self {
        self.flags |= BlockFlags::REMOVABLE;
        self
    }

    pub fn sector_count(&self) -> u64 {
        self.data.len() as u64 / self.sector_size as u64
    }

    /// Raw backing store
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drive the disk-changed line
    pub fn set_media_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    /// Replace the media with another image of the same size and raise the
    /// disk-changed line
    pub fn swap_media(&mut self, image: Vec<u8>) {
        self.data = image;
        self.changed = true;
    }

    /// Remove the media entirely
    pub fn eject(&mut self) {
        self.data = Vec::new();
        self.changed = true;
    }

    pub fn fail_reads_at(&mut self, lba: Option<u64>) {
        self.fail_read_lba = lba;
    }

    pub fn fail_writes_at(&mut self, lba: Option<u64>) {
        self.fail_write_lba = lba;
    }

    fn span(&self, lba: u64, count: u32) -> Result<(usize, usize), BlockStatus> {
        if self.data.is_empty() {
            return Err(BlockStatus::NoMedia);
        }
        let end_sector = lba.saturating_add(count as u64);
        if end_sector > self.sector_count() {
            return Err(BlockStatus::InvalidParameter);
        }
        let offset = (lba * self.sector_size as u64) as usize;
        let len = count as usize * self.sector_size as usize;
        Ok((offset, len))
    }
}

fn touches(fail: Option<u64>, lba: u64, count: u32) -> bool {
    match fail {
        Some(bad) => bad >= lba && bad < lba + count as u64,
        None => false,
    }
}

impl BlockDevice for RamDisk {
    fn geometry(&self) -> DiskGeometry {
        DiskGeometry {
            total_sectors: self.sector_count(),
            sector_size: self.sector_size,
            heads: 2,
            sectors_per_track: 18,
            flags: self.flags,
        }
    }

    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockStatus> {
        let (offset, len) = self.span(lba, count)?;
        if touches(self.fail_read_lba, lba, count) {
            return Err(BlockStatus::BadSector);
        }
        if buf.len() < len {
            return Err(BlockStatus::InvalidParameter);
        }
        buf[..len].copy_from_slice(&self.data[offset..offset + len]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockStatus> {
        let (offset, len) = self.span(lba, count)?;
        if touches(self.fail_write_lba, lba, count) {
            return Err(BlockStatus::IoError);
        }
        if buf.len() < len {
            return Err(BlockStatus::InvalidParameter);
        }
        self.data[offset..offset + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn media_changed(&mut self) -> bool {
        // The line resets once sampled
        core::mem::replace(&mut self.changed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramdisk_read_write() {
        let mut disk = RamDisk::new(8, 512);
        let buf = [0x5Au8; 512];
        disk.write_sectors(3, 1, &buf).unwrap();

        let mut back = [0u8; 512];
        disk.read_sectors(3, 1, &mut back).unwrap();
        assert_eq!(back, buf);
        assert_eq!(disk.read_sectors(8, 1, &mut back), Err(BlockStatus::InvalidParameter));
    }

    #[test]
    fn test_ramdisk_fault_injection() {
        let mut disk = RamDisk::new(8, 512);
        let mut buf = [0u8; 1024];
        disk.fail_reads_at(Some(5));
        assert_eq!(disk.read_sectors(4, 2, &mut buf), Err(BlockStatus::BadSector));
        assert!(disk.read_sectors(2, 2, &mut buf).is_ok());

        disk.fail_writes_at(Some(2));
        assert_eq!(disk.write_sectors(2, 2, &buf), Err(BlockStatus::IoError));
    }

    #[test]
    fn test_ramdisk_change_line() {
        let mut disk = RamDisk::new(8, 512).removable();
        assert!(disk.geometry().is_removable());
        assert!(!disk.media_changed());

        disk.swap_media(vec![0u8; 8 * 512]);
        assert!(disk.media_changed());
        assert!(!disk.media_changed());

        disk.eject();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_sectors(0, 1, &mut buf), Err(BlockStatus::NoMedia));
    }
}
