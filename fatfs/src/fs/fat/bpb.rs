//! FAT BIOS Parameter Block (BPB)
//!
//! The BPB is located in the boot sector (sector 0) and describes the
//! layout of the volume.
//!
//! # Boot Sector Layout
//! - Bytes 0-2: Jump instruction
//! - Bytes 3-10: OEM name
//! - Bytes 11-35: BPB common to all FAT types
//! - Bytes 36-61: Extended BPB (FAT12/16) or bytes 36-89 (FAT32)
//! - Bytes 510-511: Signature (0x55, 0xAA)
//!
//! # Region Layout
//! ```text
//! | reserved | FAT #1 | FAT #2 ... | root dir (FAT12/16) | data clusters |
//! ```

use super::error::{FatError, Result};
use super::{le16, le32, put16, put32};

/// FAT type, decided by the data cluster count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Classify a volume by its count of data clusters
    pub fn from_clusters(data_clusters: u32) -> Self {
        if data_clusters < FAT12_MAX_CLUSTERS {
            FatType::Fat12
        } else if data_clusters < FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Smallest FAT entry value that ends a chain
    pub fn terminal_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// Significant bits of a FAT entry
    pub fn entry_mask(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => cluster_values::CLUSTER_MASK,
        }
    }

    /// File system type string as stored in the extended BPB
    pub fn signature(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

/// Data cluster count at which a volume stops being FAT12
pub const FAT12_MAX_CLUSTERS: u32 = 4085;

/// Data cluster count at which a volume stops being FAT16
pub const FAT16_MAX_CLUSTERS: u32 = 65525;

/// Extended boot signature: volume id, label and type string are valid
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;

/// Largest cluster the driver accepts, in bytes
pub const MAX_CLUSTER_BYTES: u32 = 32768;

/// Sector sizes the driver accepts
pub const LEGAL_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

/// Cluster entry values common to all FAT types
pub mod cluster_values {
    /// Free cluster
    pub const FREE: u32 = 0x0000_0000;
    /// First cluster number that refers to the data area
    pub const FIRST_DATA: u32 = 2;
    /// Mask for 28-bit FAT32 cluster numbers
    pub const CLUSTER_MASK: u32 = 0x0FFF_FFFF;
    /// Reserved top bits of a FAT32 entry
    pub const FAT32_RESERVED_BITS: u32 = 0xF000_0000;
}

/// Boot sector field offsets
mod offset {
    pub const OEM_NAME: usize = 0x03;
    pub const BYTES_PER_SECTOR: usize = 0x0B;
    pub const SECTORS_PER_CLUSTER: usize = 0x0D;
    pub const RESERVED_SECTORS: usize = 0x0E;
    pub const NUM_FATS: usize = 0x10;
    pub const ROOT_ENTRIES: usize = 0x11;
    pub const TOTAL_SECTORS_16: usize = 0x13;
    pub const MEDIA: usize = 0x15;
    pub const FAT_SIZE_16: usize = 0x16;
    pub const SECTORS_PER_TRACK: usize = 0x18;
    pub const HEADS: usize = 0x1A;
    pub const HIDDEN_SECTORS: usize = 0x1C;
    pub const TOTAL_SECTORS_32: usize = 0x20;

    // FAT12/16 extended BPB
    pub const DRIVE_NUMBER: usize = 0x24;
    pub const BOOT_SIGNATURE: usize = 0x26;
    pub const VOLUME_ID: usize = 0x27;
    pub const VOLUME_LABEL: usize = 0x2B;
    pub const FS_TYPE: usize = 0x36;

    // FAT32 extended BPB
    pub const FAT_SIZE_32: usize = 0x24;
    pub const EXT_FLAGS: usize = 0x28;
    pub const FS_VERSION: usize = 0x2A;
    pub const ROOT_CLUSTER: usize = 0x2C;
    pub const FS_INFO: usize = 0x30;
    pub const BACKUP_BOOT: usize = 0x32;
    pub const DRIVE_NUMBER_32: usize = 0x40;
    pub const BOOT_SIGNATURE_32: usize = 0x42;
    pub const VOLUME_ID_32: usize = 0x43;
    pub const VOLUME_LABEL_32: usize = 0x47;
    pub const FS_TYPE_32: usize = 0x52;

    pub const SIGNATURE: usize = 510;
}

/// FAT32-only BPB fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat32Extension {
    /// Mirroring flags
    pub ext_flags: u16,
    /// First cluster of the root directory
    pub root_dir_cluster: u32,
    /// Sector number of the FSInfo sector
    pub fs_info_sector: u32,
    /// Sector number of the backup boot sector
    pub backup_boot_sector: u32,
}

/// Validated volume parameters, parsed once per mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParameters {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub number_of_fats: u32,
    /// Root directory slots (FAT12/16 only)
    pub root_dir_entries: u32,
    pub total_sectors: u32,
    pub media_type: u8,
    /// Sectors per FAT copy
    pub fat_sectors: u32,
    pub sectors_per_track: u16,
    pub heads: u16,
    /// Sectors preceding the volume on the physical disk. Stored, never
    /// applied: the disk collaborator presents volume-relative sectors.
    pub hidden_sectors: u32,

    pub root_dir_sectors: u32,
    pub data_sectors: u32,
    pub data_clusters: u32,
    pub fs_type: FatType,
    pub terminal_cluster: u32,

    pub drive_number: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_signature: [u8; 8],

    pub fat32: Option<Fat32Extension>,
}

impl VolumeParameters {
    /// Parse and validate sector 0 of a volume.
    ///
    /// `device_sector_size` is the sector size of the underlying device;
    /// the BPB must agree with it.
    pub fn parse(sector: &[u8], device_sector_size: u32) -> Result<Self> {
        if sector.len() < 512 {
            return Err(FatError::Validation("boot sector shorter than 512 bytes"));
        }
        if sector[offset::SIGNATURE] != 0x55 || sector[offset::SIGNATURE + 1] != 0xAA {
            return Err(FatError::Validation("missing 0x55AA boot sector signature"));
        }

        let bytes_per_sector = le16(sector, offset::BYTES_PER_SECTOR) as u32;
        if !LEGAL_SECTOR_SIZES.contains(&bytes_per_sector) {
            return Err(FatError::Validation("illegal bytes per sector"));
        }
        if bytes_per_sector != device_sector_size {
            return Err(FatError::Validation("bytes per sector differs from the device"));
        }

        let sectors_per_cluster = sector[offset::SECTORS_PER_CLUSTER] as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FatError::Validation("illegal sectors per cluster"));
        }
        if bytes_per_sector * sectors_per_cluster > MAX_CLUSTER_BYTES {
            return Err(FatError::Validation("cluster larger than 32 KiB"));
        }

        let reserved_sectors = le16(sector, offset::RESERVED_SECTORS) as u32;
        if reserved_sectors < 1 {
            return Err(FatError::Validation("no reserved sectors"));
        }

        let number_of_fats = sector[offset::NUM_FATS] as u32;
        if number_of_fats < 1 {
            return Err(FatError::Validation("no FAT copies"));
        }

        let media_type = sector[offset::MEDIA];
        if !is_legal_media(media_type) {
            return Err(FatError::Validation("illegal media type"));
        }

        let mut fat_sectors = le16(sector, offset::FAT_SIZE_16) as u32;
        if fat_sectors == 0 {
            fat_sectors = le32(sector, offset::FAT_SIZE_32);
        }
        if fat_sectors == 0 {
            return Err(FatError::Validation("zero sectors per FAT"));
        }

        let total16 = le16(sector, offset::TOTAL_SECTORS_16) as u32;
        let total32 = le32(sector, offset::TOTAL_SECTORS_32);
        let total_sectors = match (total16, total32) {
            (0, 0) => return Err(FatError::Validation("zero total sectors")),
            (0, total) => total,
            (total, _) => total,
        };

        let root_dir_entries = le16(sector, offset::ROOT_ENTRIES) as u32;
        let root_dir_sectors = (32 * root_dir_entries).div_ceil(bytes_per_sector);

        let overhead = reserved_sectors as u64
            + number_of_fats as u64 * fat_sectors as u64
            + root_dir_sectors as u64;
        if overhead >= total_sectors as u64 {
            return Err(FatError::Validation("volume smaller than its metadata"));
        }
        let data_sectors = total_sectors - overhead as u32;
        let data_clusters = data_sectors / sectors_per_cluster;
        if data_clusters == 0 {
            return Err(FatError::Validation("no data clusters"));
        }

        let fs_type = FatType::from_clusters(data_clusters);

        // The FAT must be able to describe every data cluster
        let fat_bits: u64 = match fs_type {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        };
        let fat_bytes = ((data_clusters as u64 + 2) * fat_bits).div_ceil(8);
        if fat_sectors as u64 * (bytes_per_sector as u64) < fat_bytes {
            return Err(FatError::Validation("FAT too small for the data area"));
        }

        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&sector[offset::OEM_NAME..offset::OEM_NAME + 8]);

        let mut params = VolumeParameters {
            oem_name,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            number_of_fats,
            root_dir_entries,
            total_sectors,
            media_type,
            fat_sectors,
            sectors_per_track: le16(sector, offset::SECTORS_PER_TRACK),
            heads: le16(sector, offset::HEADS),
            hidden_sectors: le32(sector, offset::HIDDEN_SECTORS),
            root_dir_sectors,
            data_sectors,
            data_clusters,
            fs_type,
            terminal_cluster: fs_type.terminal_cluster(),
            drive_number: 0,
            boot_signature: 0,
            volume_id: 0,
            volume_label: [b' '; 11],
            fs_signature: [b' '; 8],
            fat32: None,
        };

        let (drive, sig, id, label, fs_str) = if fs_type == FatType::Fat32 {
            if le16(sector, offset::FS_VERSION) != 0 {
                return Err(FatError::Validation("unsupported FAT32 version"));
            }

            let root_dir_cluster = le32(sector, offset::ROOT_CLUSTER);
            if root_dir_cluster < 2 || root_dir_cluster > data_clusters + 1 {
                return Err(FatError::Validation("FAT32 root cluster out of range"));
            }

            let fs_info_sector = le16(sector, offset::FS_INFO) as u32;
            if fs_info_sector < 1 || fs_info_sector >= reserved_sectors {
                return Err(FatError::Validation("FSInfo sector out of range"));
            }

            params.fat32 = Some(Fat32Extension {
                ext_flags: le16(sector, offset::EXT_FLAGS),
                root_dir_cluster,
                fs_info_sector,
                backup_boot_sector: le16(sector, offset::BACKUP_BOOT) as u32,
            });

            (
                offset::DRIVE_NUMBER_32,
                offset::BOOT_SIGNATURE_32,
                offset::VOLUME_ID_32,
                offset::VOLUME_LABEL_32,
                offset::FS_TYPE_32,
            )
        } else {
            (
                offset::DRIVE_NUMBER,
                offset::BOOT_SIGNATURE,
                offset::VOLUME_ID,
                offset::VOLUME_LABEL,
                offset::FS_TYPE,
            )
        };

        params.drive_number = sector[drive];
        params.boot_signature = sector[sig];
        if params.boot_signature == EXTENDED_BOOT_SIGNATURE {
            params.volume_id = le32(sector, id);
            params.volume_label.copy_from_slice(&sector[label..label + 11]);
            params.fs_signature.copy_from_slice(&sector[fs_str..fs_str + 8]);
        }

        Ok(params)
    }

    /// Serialize into a boot sector. Boot code bytes are left untouched.
    pub fn write_boot_sector(&self, sector: &mut [u8]) {
        sector[0] = 0xEB;
        sector[1] = 0x3C;
        sector[2] = 0x90;
        sector[offset::OEM_NAME..offset::OEM_NAME + 8].copy_from_slice(&self.oem_name);
        put16(sector, offset::BYTES_PER_SECTOR, self.bytes_per_sector as u16);
        sector[offset::SECTORS_PER_CLUSTER] = self.sectors_per_cluster as u8;
        put16(sector, offset::RESERVED_SECTORS, self.reserved_sectors as u16);
        sector[offset::NUM_FATS] = self.number_of_fats as u8;
        put16(sector, offset::ROOT_ENTRIES, self.root_dir_entries as u16);
        sector[offset::MEDIA] = self.media_type;
        put16(sector, offset::SECTORS_PER_TRACK, self.sectors_per_track);
        put16(sector, offset::HEADS, self.heads);
        put32(sector, offset::HIDDEN_SECTORS, self.hidden_sectors);

        if self.total_sectors < 0x10000 && self.fat32.is_none() {
            put16(sector, offset::TOTAL_SECTORS_16, self.total_sectors as u16);
            put32(sector, offset::TOTAL_SECTORS_32, 0);
        } else {
            put16(sector, offset::TOTAL_SECTORS_16, 0);
            put32(sector, offset::TOTAL_SECTORS_32, self.total_sectors);
        }

        let (drive, sig, id, label, fs_str) = match &self.fat32 {
            Some(ext) => {
                put16(sector, offset::FAT_SIZE_16, 0);
                put32(sector, offset::FAT_SIZE_32, self.fat_sectors);
                put16(sector, offset::EXT_FLAGS, ext.ext_flags);
                put16(sector, offset::FS_VERSION, 0);
                put32(sector, offset::ROOT_CLUSTER, ext.root_dir_cluster);
                put16(sector, offset::FS_INFO, ext.fs_info_sector as u16);
                put16(sector, offset::BACKUP_BOOT, ext.backup_boot_sector as u16);
                (
                    offset::DRIVE_NUMBER_32,
                    offset::BOOT_SIGNATURE_32,
                    offset::VOLUME_ID_32,
                    offset::VOLUME_LABEL_32,
                    offset::FS_TYPE_32,
                )
            }
            None => {
                put16(sector, offset::FAT_SIZE_16, self.fat_sectors as u16);
                (
                    offset::DRIVE_NUMBER,
                    offset::BOOT_SIGNATURE,
                    offset::VOLUME_ID,
                    offset::VOLUME_LABEL,
                    offset::FS_TYPE,
                )
            }
        };

        sector[drive] = self.drive_number;
        sector[sig] = self.boot_signature;
        put32(sector, id, self.volume_id);
        sector[label..label + 11].copy_from_slice(&self.volume_label);
        sector[fs_str..fs_str + 8].copy_from_slice(&self.fs_signature);

        sector[offset::SIGNATURE] = 0x55;
        sector[offset::SIGNATURE + 1] = 0xAA;
    }

    /// Cluster size in bytes
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// First sector of FAT copy 0
    pub fn first_fat_sector(&self) -> u32 {
        self.reserved_sectors
    }

    /// First sector of the fixed root directory (FAT12/16)
    pub fn root_dir_start(&self) -> u32 {
        self.reserved_sectors + self.number_of_fats * self.fat_sectors
    }

    pub fn first_data_sector(&self) -> u32 {
        self.root_dir_start() + self.root_dir_sectors
    }

    /// First sector of a data cluster
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector() as u64
            + (cluster - cluster_values::FIRST_DATA) as u64 * self.sectors_per_cluster as u64
    }

    /// Highest valid cluster number
    pub fn max_cluster(&self) -> u32 {
        self.data_clusters + 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= cluster_values::FIRST_DATA && cluster <= self.max_cluster()
    }

    pub fn is_terminal(&self, value: u32) -> bool {
        value >= self.terminal_cluster
    }

    /// First cluster of the root directory, 0 where the root is fixed
    pub fn root_dir_cluster(&self) -> u32 {
        self.fat32.map(|ext| ext.root_dir_cluster).unwrap_or(0)
    }

    /// Offset of the volume id in the boot sector
    pub fn volume_id_offset(&self) -> usize {
        if self.fat32.is_some() {
            offset::VOLUME_ID_32
        } else {
            offset::VOLUME_ID
        }
    }

    /// Volume label with trailing padding removed
    pub fn label(&self) -> &str {
        let end = self
            .volume_label
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map(|p| p + 1)
            .unwrap_or(0);
        core::str::from_utf8(&self.volume_label[..end]).unwrap_or("")
    }
}

/// Legal media descriptor bytes
pub fn is_legal_media(media: u8) -> bool {
    media == 0xF0 || media >= 0xF8
}

/// Quick check whether a volume might be FAT, before a full mount.
///
/// Looks only at the sector signature, the sector size, the media byte and
/// (when an extended boot signature says it is present) the type string.
pub fn detect(sector: &[u8], device_sector_size: u32) -> bool {
    if sector.len() < 512 {
        return false;
    }
    if sector[offset::SIGNATURE] != 0x55 || sector[offset::SIGNATURE + 1] != 0xAA {
        return false;
    }

    let bytes_per_sector = le16(sector, offset::BYTES_PER_SECTOR) as u32;
    if !LEGAL_SECTOR_SIZES.contains(&bytes_per_sector) || bytes_per_sector != device_sector_size {
        return false;
    }
    if !is_legal_media(sector[offset::MEDIA]) {
        return false;
    }

    if sector[offset::BOOT_SIGNATURE] == EXTENDED_BOOT_SIGNATURE {
        return &sector[offset::FS_TYPE..offset::FS_TYPE + 3] == b"FAT";
    }
    // A zero 16-bit FAT size means the FAT32 layout applies
    if le16(sector, offset::FAT_SIZE_16) == 0
        && sector[offset::BOOT_SIGNATURE_32] == EXTENDED_BOOT_SIGNATURE
    {
        return &sector[offset::FS_TYPE_32..offset::FS_TYPE_32 + 3] == b"FAT";
    }
    true
}

/// FAT32 FSInfo sector hints
///
/// Both values are advisory; the free bitmap built at mount is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    /// Free cluster count, or [`FsInfo::UNKNOWN`]
    pub free_cluster_count: u32,
    /// Where to start looking for free clusters, or [`FsInfo::UNKNOWN`]
    pub next_free_cluster: u32,
}

impl FsInfo {
    /// Leading signature value
    pub const LEAD_SIG: u32 = 0x4161_5252;
    /// Structure signature value
    pub const STRUCT_SIG: u32 = 0x6141_7272;
    /// Trailing signature value
    pub const TRAIL_SIG: u32 = 0xAA55_0000;
    /// Value meaning "not known"
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    const LEAD_OFFSET: usize = 0x000;
    const STRUCT_OFFSET: usize = 0x1E4;
    const FREE_COUNT_OFFSET: usize = 0x1E8;
    const NEXT_FREE_OFFSET: usize = 0x1EC;
    const TRAIL_OFFSET: usize = 0x1FC;

    pub fn parse(sector: &[u8], data_clusters: u32) -> Result<Self> {
        if sector.len() < 512 {
            return Err(FatError::Validation("FSInfo sector shorter than 512 bytes"));
        }
        if le32(sector, Self::LEAD_OFFSET) != Self::LEAD_SIG
            || le32(sector, Self::STRUCT_OFFSET) != Self::STRUCT_SIG
            || le32(sector, Self::TRAIL_OFFSET) != Self::TRAIL_SIG
        {
            return Err(FatError::Validation("bad FSInfo signature"));
        }

        let info = FsInfo {
            free_cluster_count: le32(sector, Self::FREE_COUNT_OFFSET),
            next_free_cluster: le32(sector, Self::NEXT_FREE_OFFSET),
        };
        if info.free_cluster_count != Self::UNKNOWN && info.free_cluster_count > data_clusters {
            return Err(FatError::Validation("FSInfo free count out of range"));
        }
        if info.next_free_cluster != Self::UNKNOWN
            && !Self::hint_in_range(info.next_free_cluster, data_clusters)
        {
            return Err(FatError::Validation("FSInfo next free cluster out of range"));
        }
        Ok(info)
    }

    /// The next-free hint to record for `cluster`, or [`FsInfo::UNKNOWN`]
    /// when it is missing or would not be accepted by [`FsInfo::parse`].
    pub fn next_free_hint(cluster: Option<u32>, data_clusters: u32) -> u32 {
        match cluster {
            Some(c) if Self::hint_in_range(c, data_clusters) => c,
            _ => Self::UNKNOWN,
        }
    }

    fn hint_in_range(cluster: u32, data_clusters: u32) -> bool {
        (2..=data_clusters).contains(&cluster)
    }

    pub fn has_free_count(&self) -> bool {
        self.free_cluster_count != Self::UNKNOWN
    }

    /// Write signatures and both hints into an FSInfo sector
    pub fn write(&self, sector: &mut [u8]) {
        put32(sector, Self::LEAD_OFFSET, Self::LEAD_SIG);
        put32(sector, Self::STRUCT_OFFSET, Self::STRUCT_SIG);
        put32(sector, Self::TRAIL_OFFSET, Self::TRAIL_SIG);
        self.patch(sector);
    }

    /// Update only the two hint fields of an existing FSInfo sector
    pub fn patch(&self, sector: &mut [u8]) {
        put32(sector, Self::FREE_COUNT_OFFSET, self.free_cluster_count);
        put32(sector, Self::NEXT_FREE_OFFSET, self.next_free_cluster);
    }
}
