//! Block Device Abstraction Layer
//!
//! The FAT driver never touches hardware directly. Everything it reads or
//! writes goes through a [`Disk`], which owns one [`BlockDevice`] behind the
//! device lock.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FAT Volume                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Disk (device lock + stats)                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │    ATA/IDE      │ │     Floppy      │ │    RAM disk     │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// Default sector size
pub const SECTOR_SIZE: usize = 512;

/// Block device status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockStatus {
    /// Device not found
    NotFound = 1,
    /// I/O error
    IoError = 2,
    /// Invalid parameter
    InvalidParameter = 3,
    /// Media not present
    NoMedia = 5,
    /// Write protected
    WriteProtected = 6,
    /// Bad sector
    BadSector = 9,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::NotFound => "device not found",
            BlockStatus::IoError => "I/O error",
            BlockStatus::InvalidParameter => "invalid parameter",
            BlockStatus::NoMedia => "no media",
            BlockStatus::WriteProtected => "write protected",
            BlockStatus::BadSector => "bad sector",
        }
    }
}

bitflags::bitflags! {
    /// Block device flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// Device is removable
        const REMOVABLE = 0x0001;
        /// Device is read-only
        const READ_ONLY = 0x0002;
    }
}

/// Disk geometry information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Total number of sectors
    pub total_sectors: u64,
    /// Bytes per sector
    pub sector_size: u32,
    /// Heads per cylinder (CHS mode)
    pub heads: u16,
    /// Sectors per track (CHS mode)
    pub sectors_per_track: u16,
    /// Device flags
    pub flags: BlockFlags,
}

impl DiskGeometry {
    pub const fn new(total_sectors: u64, sector_size: u32) -> Self {
        Self {
            total_sectors,
            sector_size,
            heads: 0,
            sectors_per_track: 0,
            flags: BlockFlags::empty(),
        }
    }

    /// Get total size in bytes
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors * self.sector_size as u64
    }

    pub fn is_removable(&self) -> bool {
        self.flags.contains(BlockFlags::REMOVABLE)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(BlockFlags::READ_ONLY)
    }
}

/// A device that transfers whole sectors.
///
/// Implementations do not lock; [`Disk`] serializes every call.
pub trait BlockDevice: Send {
    /// Geometry of the device. Must not change while a volume is mounted,
    /// except for the removable media itself.
    fn geometry(&self) -> DiskGeometry;

    /// Read `count` sectors starting at `lba` into `buf`
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockStatus>;

    /// Write `count` sectors starting at `lba` from `buf`
    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockStatus>;

    /// State of the disk-changed line. Only meaningful for removable media.
    fn media_changed(&mut self) -> bool {
        false
    }

    /// Flush any write-back cache of the device
    fn flush(&mut self) -> Result<(), BlockStatus> {
        Ok(())
    }
}

/// Transfer statistics of a [`Disk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskStats {
    /// Read requests
    pub reads: u64,
    /// Write requests
    pub writes: u64,
    /// Sectors read
    pub sectors_read: u64,
    /// Sectors written
    pub sectors_written: u64,
    /// Failed requests
    pub errors: u32,
}

/// A block device behind its device lock.
///
/// The lock is taken for exactly one transfer and released before the call
/// returns, so callers never hold it across FAT bookkeeping.
pub struct Disk<D: BlockDevice> {
    device: Mutex<D>,
    geometry: DiskGeometry,
    reads: AtomicU64,
    writes: AtomicU64,
    sectors_read: AtomicU64,
    sectors_written: AtomicU64,
    errors: AtomicU32,
}

impl<D: BlockDevice> Disk<D> {
    pub fn new(device: D) -> Self {
        let geometry = device.geometry();
        Self {
            device: Mutex::new(device),
            geometry,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            sectors_read: AtomicU64::new(0),
            sectors_written: AtomicU64::new(0),
            errors: AtomicU32::new(0),
        }
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    pub fn is_removable(&self) -> bool {
        self.geometry.is_removable()
    }

    /// Lock the device for direct access.
    ///
    /// Used by device owners (media swaps, failure injection); the driver
    /// itself only goes through [`Disk::read`] and [`Disk::write`].
    pub fn device(&self) -> MutexGuard<'_, D> {
        self.device.lock()
    }

    fn check_transfer(&self, lba: u64, count: u32, len: usize) -> Result<(), BlockStatus> {
        let expected = count as usize * self.geometry.sector_size as usize;
        if count == 0 || len != expected {
            return Err(BlockStatus::InvalidParameter);
        }
        if lba.saturating_add(count as u64) > self.geometry.total_sectors {
            return Err(BlockStatus::InvalidParameter);
        }
        Ok(())
    }

    /// Read sectors under the device lock
    pub fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockStatus> {
        self.check_transfer(lba, count, buf.len())?;

        let result = self.device.lock().read_sectors(lba, count, buf);

        self.reads.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.sectors_read.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Write sectors under the device lock
    pub fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockStatus> {
        self.check_transfer(lba, count, buf.len())?;
        if self.geometry.is_read_only() {
            return Err(BlockStatus::WriteProtected);
        }

        let result = self.device.lock().write_sectors(lba, count, buf);

        self.writes.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.sectors_written.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Sample the disk-changed line. Fixed disks never report a change.
    pub fn media_changed(&self) -> bool {
        if !self.is_removable() {
            return false;
        }
        self.device.lock().media_changed()
    }

    pub fn flush(&self) -> Result<(), BlockStatus> {
        self.device.lock().flush()
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            sectors_read: self.sectors_read.load(Ordering::Relaxed),
            sectors_written: self.sectors_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.sectors_read.store(0, Ordering::Relaxed);
        self.sectors_written.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ramdisk::RamDisk;
    use alloc::vec;

    #[test]
    fn test_transfer_length_checked() {
        let disk = Disk::new(RamDisk::new(16, 512));
        let mut buf = vec![0u8; 100];
        assert_eq!(disk.read(0, 1, &mut buf), Err(BlockStatus::InvalidParameter));

        let mut buf = vec![0u8; 1024];
        assert_eq!(disk.read(15, 2, &mut buf), Err(BlockStatus::InvalidParameter));
        assert!(disk.read(14, 2, &mut buf).is_ok());
    }

    #[test]
    fn test_stats_count_requests() {
        let disk = Disk::new(RamDisk::new(16, 512));
        let buf = vec![0xA5u8; 2048];
        disk.write(4, 4, &buf).unwrap();

        let mut back = vec![0u8; 2048];
        disk.read(4, 4, &mut back).unwrap();
        assert_eq!(back, buf);

        let stats = disk.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.sectors_read, 4);
        assert_eq!(stats.sectors_written, 4);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_fixed_disk_never_reports_change() {
        let disk = Disk::new(RamDisk::new(16, 512));
        disk.device().set_media_changed(true);
        assert!(!disk.media_changed());
    }
}
