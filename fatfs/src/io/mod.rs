//! I/O layer consumed by the FAT driver
//!
//! - **block**: the block-device collaborator and its scoped device lock
//! - **ramdisk**: an in-memory block device

pub mod block;
pub mod ramdisk;

pub use block::{BlockDevice, BlockFlags, BlockStatus, Disk, DiskGeometry, DiskStats};
pub use ramdisk::RamDisk;
