//! FAT12/16/32 Volume Driver
//!
//! The FAT file system driver of Nostalgia OS, split out as a library so it
//! can be linked into the kernel and exercised on the host.
//!
//! # Layout
//!
//! - **io** - Block device collaborator (device lock, sector transfers) and
//!   an in-memory RAM disk
//! - **fs::vfs** - The generic file-entry tree the driver populates
//! - **fs::fat** - The driver proper: boot sector parser, FAT sector cache,
//!   cluster-chain engine, free-space allocator, directory codec, the
//!   volume operations façade, a repairing chain check and a formatter
//!
//! # Locking
//!
//! Every raw transfer is bracketed by the device lock held inside
//! [`io::block::Disk`]. Each mounted volume additionally owns a free-bitmap
//! lock and a FAT sector cache lock, always taken in that order.

#![no_std]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod io;
pub mod fs;

pub use fs::fat::{
    CheckReport, FatConfig, FatError, FatType, FatVolume, FormatOptions, InlineSpawner, Result,
    TaskSpawner, VolumeParameters, VolumeState,
};
pub use fs::vfs::{DateTime, EntryArena, EntryId, EntryTree, FileEntry, FileType};
pub use io::block::{BlockDevice, BlockStatus, Disk, DiskGeometry};
