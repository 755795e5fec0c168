//! File System Subsystem
//!
//! - **vfs**: the generic file-entry tree file system drivers populate
//! - **fat**: FAT12/16/32 driver
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Virtual File System (entry tree)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FAT volume façade                         │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐   │
//! │  │ Dir codec │ │ Allocator │ │  Chains   │ │ FAT cache │   │
//! │  └───────────┘ └───────────┘ └───────────┘ └───────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Block device (Disk)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod vfs;
pub mod fat;
