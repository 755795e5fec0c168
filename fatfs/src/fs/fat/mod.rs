//! FAT12/16/32 File System Driver
//!
//! Implements the FAT family on top of a [`Disk`](crate::io::block::Disk):
//! - **bpb**: boot sector and FSInfo parsing, FAT type determination
//! - **cache**: LRU cache of FAT sectors with write-back to every FAT copy
//! - **table**: FAT entry encoding and cluster-chain walking
//! - **bitmap**: free-cluster bitmap and the cluster allocator
//! - **dir**: on-disk directory entries, VFAT long names, timestamps
//! - **alias**: name validation and 8.3 short alias generation
//! - **pool**: per-entry private data
//! - **volume**: mount/sync/unmount and the file operations the VFS calls
//! - **check**: cluster-chain consistency check with optional repair
//! - **format**: creating an empty FAT volume
//!
//! # FAT Type
//!
//! The type of a volume is decided only by its count of data clusters:
//! fewer than 4085 is FAT12, fewer than 65525 is FAT16, anything else is
//! FAT32. The type string in the boot sector is a hint for detection only.

pub mod error;
pub mod config;
pub mod bpb;
pub mod cache;
pub mod table;
pub mod bitmap;
pub mod dir;
pub mod alias;
pub mod pool;
pub mod volume;
pub mod check;
pub mod format;

pub use error::{FatError, Resource, Result};
pub use config::FatConfig;
pub use bpb::{FatType, FsInfo, VolumeParameters};
pub use format::{format, FormatOptions};
pub use volume::{FatVolume, InlineSpawner, TaskSpawner, VolumeState};
pub use check::CheckReport;

#[inline]
pub(crate) fn le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub(crate) fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
pub(crate) fn put16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
