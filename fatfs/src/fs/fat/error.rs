//! FAT driver errors

use core::fmt;
use crate::fs::vfs::FsStatus;
use crate::io::block::BlockStatus;

/// A resource the driver can run out of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Free clusters on the volume
    Clusters,
    /// Slots in a fixed-size root directory
    DirectoryEntries,
    /// Private entry-data pool
    EntryData,
    /// VFS file entries
    FileEntries,
    /// "~N" short alias numbers
    AliasNumbers,
}

/// FAT driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// Boot sector, FSInfo, directory entry or name out of its legal range
    Validation(&'static str),
    /// The block device failed a transfer
    Io(BlockStatus),
    /// Removable media was swapped under the mounted volume
    MediaChanged,
    /// Out of clusters, directory slots, pool slots or alias numbers
    ResourceExhausted(Resource),
    /// On-disk structures disagree with each other or with the entry tree
    Structural(&'static str),
    /// Caller passed something the operation cannot act on
    InvalidParameter(&'static str),
    /// Volume is not in a state that allows the operation
    NotMounted,
}

pub type Result<T> = core::result::Result<T, FatError>;

impl FatError {
    /// Status code reported to the VFS layer
    pub fn status(&self) -> FsStatus {
        match self {
            FatError::Validation(_) => FsStatus::InvalidFileSystem,
            FatError::Io(_) => FsStatus::IoError,
            FatError::MediaChanged => FsStatus::MediaChanged,
            FatError::ResourceExhausted(Resource::Clusters) => FsStatus::DiskFull,
            FatError::ResourceExhausted(Resource::DirectoryEntries) => FsStatus::DiskFull,
            FatError::ResourceExhausted(Resource::AliasNumbers) => FsStatus::NameTooLong,
            FatError::ResourceExhausted(_) => FsStatus::TooManyFiles,
            FatError::Structural(_) => FsStatus::Corrupt,
            FatError::InvalidParameter(_) => FsStatus::InvalidParameter,
            FatError::NotMounted => FsStatus::NotMounted,
        }
    }
}

impl From<BlockStatus> for FatError {
    fn from(status: BlockStatus) -> Self {
        FatError::Io(status)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Resource::Clusters => "free clusters",
            Resource::DirectoryEntries => "directory entries",
            Resource::EntryData => "entry data slots",
            Resource::FileEntries => "file entries",
            Resource::AliasNumbers => "short alias numbers",
        };
        f.write_str(what)
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatError::Validation(msg) => write!(f, "invalid FAT structure: {}", msg),
            FatError::Io(status) => write!(f, "disk I/O failed: {}", status.as_str()),
            FatError::MediaChanged => f.write_str("removable media changed"),
            FatError::ResourceExhausted(what) => write!(f, "out of {}", what),
            FatError::Structural(msg) => write!(f, "inconsistent FAT volume: {}", msg),
            FatError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            FatError::NotMounted => f.write_str("volume not mounted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_status_mapping() {
        assert_eq!(FatError::from(BlockStatus::BadSector).status(), FsStatus::IoError);
        assert_eq!(
            FatError::ResourceExhausted(Resource::Clusters).status(),
            FsStatus::DiskFull
        );
        assert_eq!(FatError::Structural("x").status(), FsStatus::Corrupt);
    }

    #[test]
    fn test_display() {
        let msg = FatError::ResourceExhausted(Resource::AliasNumbers).to_string();
        assert_eq!(msg, "out of short alias numbers");
    }
}
