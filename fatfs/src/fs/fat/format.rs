//! Creating an empty FAT volume
//!
//! Lays out a FAT12, FAT16 or FAT32 volume over a whole disk: boot sector,
//! two FAT copies, the fixed root directory (FAT12/16) or a one-cluster
//! root chain (FAT32) with its FSInfo and backup boot sector.
//!
//! # Layout Choice
//!
//! Unless forced, the type follows the disk size: below 8400 sectors
//! FAT12, below 66600 FAT16, FAT32 above. Cluster sizes for FAT16 and FAT32
//! come from the usual size tables; FAT12 doubles its cluster size until
//! fewer than 4085 clusters remain.

use alloc::vec;
use crate::io::block::{BlockDevice, Disk};
use super::bpb::{
    cluster_values, Fat32Extension, FatType, FsInfo, VolumeParameters, EXTENDED_BOOT_SIGNATURE,
};
use super::error::{FatError, Result};
use super::put32;

/// Sectors below which FAT12 is chosen
const FAT12_MAX_SECTORS: u32 = 8400;

/// Sectors below which FAT16 is chosen
const FAT16_MAX_SECTORS: u32 = 66600;

/// Disk size limit (sectors) to sectors per cluster, FAT16
const FAT16_CLUSTER_SIZES: [(u32, u32); 7] = [
    (32680, 2),        // up to 16M
    (262144, 4),       // up to 128M
    (524288, 8),       // up to 256M
    (1048576, 16),     // up to 512M
    (2097152, 32),     // up to 1G
    (4194304, 64),     // up to 2G
    (u32::MAX, 64),
];

/// Disk size limit (sectors) to sectors per cluster, FAT32
const FAT32_CLUSTER_SIZES: [(u32, u32); 5] = [
    (532480, 1),       // up to 260M
    (16777216, 8),     // up to 8G
    (33554432, 16),    // up to 16G
    (67108864, 32),    // up to 32G
    (u32::MAX, 64),
];

const NUMBER_OF_FATS: u32 = 2;
const FAT32_FS_INFO_SECTOR: u32 = 1;
const FAT32_BACKUP_BOOT_SECTOR: u32 = 6;
const FAT32_ROOT_CLUSTER: u32 = 2;

/// Sectors zeroed per transfer while clearing
const CLEAR_CHUNK_SECTORS: u32 = 128;

/// Format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Force a FAT type instead of choosing one by size
    pub fs_type: Option<FatType>,
    /// Volume label, space padded
    pub label: [u8; 11],
    pub volume_id: u32,
    /// Zero every sector of the disk, not just the system area
    pub long_format: bool,
}

impl FormatOptions {
    pub const fn new() -> Self {
        Self {
            fs_type: None,
            label: *b"NO NAME    ",
            volume_id: 0,
            long_format: false,
        }
    }

    pub const fn with_type(mut self, fs_type: FatType) -> Self {
        self.fs_type = Some(fs_type);
        self
    }

    pub const fn with_volume_id(mut self, volume_id: u32) -> Self {
        self.volume_id = volume_id;
        self
    }

    pub const fn with_long_format(mut self, long_format: bool) -> Self {
        self.long_format = long_format;
        self
    }

    /// Set the label. Uppercased, cut to 11 bytes, non-ASCII becomes '_'.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = [b' '; 11];
        for (slot, ch) in self.label.iter_mut().zip(label.chars()) {
            *slot = if ch.is_ascii() && !ch.is_ascii_control() {
                ch.to_ascii_uppercase() as u8
            } else {
                b'_'
            };
        }
        self
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn cluster_size_for(table: &[(u32, u32)], total: u32) -> u32 {
    table
        .iter()
        .find(|&&(limit, _)| total <= limit)
        .map(|&(_, spc)| spc)
        .unwrap_or(64)
}

/// Work out the volume layout for `fs_type` on a disk of `total` sectors
fn plan_layout(fs_type: FatType, total: u32) -> Result<(u32, u32, u32, u32)> {
    let (reserved, root_entries, spc) = match fs_type {
        FatType::Fat12 => {
            let mut spc = 1;
            while total / spc >= 4085 && spc < 64 {
                spc *= 2;
            }
            (1u32, 224u32, spc)
        }
        FatType::Fat16 => (1u32, 512u32, cluster_size_for(&FAT16_CLUSTER_SIZES, total)),
        FatType::Fat32 => (32u32, 0u32, cluster_size_for(&FAT32_CLUSTER_SIZES, total)),
    };

    let root_dir_sectors = (32 * root_entries).div_ceil(512);
    let system = reserved + root_dir_sectors;
    if total <= system {
        return Err(FatError::InvalidParameter("disk too small for a FAT volume"));
    }

    let mut per_fat_sector = 256 * spc + NUMBER_OF_FATS;
    if fs_type == FatType::Fat32 {
        per_fat_sector /= 2;
    }
    let fat_sectors = (total - system).div_ceil(per_fat_sector);

    Ok((reserved, root_entries, spc, fat_sectors))
}

/// Format `disk` as an empty FAT volume and return its parameters.
///
/// Only disks with 512-byte sectors can be formatted. Fails with
/// `InvalidParameter` when the disk cannot hold a volume of the requested
/// type.
pub fn format<D: BlockDevice>(disk: &Disk<D>, options: &FormatOptions) -> Result<VolumeParameters> {
    let geometry = disk.geometry();
    if geometry.sector_size != 512 {
        return Err(FatError::InvalidParameter("only 512-byte sectors can be formatted"));
    }
    let total = u32::try_from(geometry.total_sectors)
        .map_err(|_| FatError::InvalidParameter("disk too large for FAT"))?;

    let fs_type = options.fs_type.unwrap_or(if total < FAT12_MAX_SECTORS {
        FatType::Fat12
    } else if total < FAT16_MAX_SECTORS {
        FatType::Fat16
    } else {
        FatType::Fat32
    });

    let (reserved, root_entries, spc, fat_sectors) = plan_layout(fs_type, total)?;
    let root_dir_sectors = (32 * root_entries).div_ceil(512);
    let overhead = reserved + NUMBER_OF_FATS * fat_sectors + root_dir_sectors;
    if overhead >= total {
        return Err(FatError::InvalidParameter("disk too small for a FAT volume"));
    }
    let data_sectors = total - overhead;
    let data_clusters = data_sectors / spc;
    if data_clusters == 0 || FatType::from_clusters(data_clusters) != fs_type {
        return Err(FatError::InvalidParameter("disk size does not suit the requested FAT type"));
    }

    let removable = geometry.is_removable();
    let params = VolumeParameters {
        oem_name: *b"MSWIN4.1",
        bytes_per_sector: 512,
        sectors_per_cluster: spc,
        reserved_sectors: reserved,
        number_of_fats: NUMBER_OF_FATS,
        root_dir_entries: root_entries,
        total_sectors: total,
        media_type: if removable { 0xF0 } else { 0xF8 },
        fat_sectors,
        sectors_per_track: geometry.sectors_per_track,
        heads: geometry.heads,
        hidden_sectors: 0,
        root_dir_sectors,
        data_sectors,
        data_clusters,
        fs_type,
        terminal_cluster: fs_type.terminal_cluster(),
        drive_number: if removable { 0x00 } else { 0x80 },
        boot_signature: EXTENDED_BOOT_SIGNATURE,
        volume_id: options.volume_id,
        volume_label: options.label,
        fs_signature: *fs_type.signature(),
        fat32: match fs_type {
            FatType::Fat32 => Some(Fat32Extension {
                ext_flags: 0,
                root_dir_cluster: FAT32_ROOT_CLUSTER,
                fs_info_sector: FAT32_FS_INFO_SECTOR,
                backup_boot_sector: FAT32_BACKUP_BOOT_SECTOR,
            }),
            _ => None,
        },
    };

    log::info!(
        target: "fatfs",
        "formatting {:?}: {} sectors, {} per cluster, {} FAT sectors, {} clusters",
        fs_type,
        total,
        spc,
        fat_sectors,
        data_clusters
    );

    // System area, plus the root cluster on FAT32
    let clear = if options.long_format {
        total
    } else if fs_type == FatType::Fat32 {
        overhead + spc
    } else {
        overhead
    };
    clear_sectors(disk, clear)?;

    let mut sector = vec![0u8; 512];
    write_reserved_entries(&params, &mut sector);
    for copy in 0..NUMBER_OF_FATS {
        disk.write((reserved + copy * fat_sectors) as u64, 1, &sector)?;
    }

    if let Some(ext) = params.fat32 {
        let info = FsInfo {
            free_cluster_count: data_clusters - 1,
            next_free_cluster: FAT32_ROOT_CLUSTER + 1,
        };
        sector.fill(0);
        info.write(&mut sector);
        disk.write(ext.fs_info_sector as u64, 1, &sector)?;
        disk.write((ext.backup_boot_sector + ext.fs_info_sector) as u64, 1, &sector)?;
    }

    sector.fill(0);
    params.write_boot_sector(&mut sector);
    disk.write(0, 1, &sector)?;
    if let Some(ext) = params.fat32 {
        disk.write(ext.backup_boot_sector as u64, 1, &sector)?;
    }
    disk.flush()?;

    let parsed = VolumeParameters::parse(&sector, 512)?;
    if parsed.fs_type != fs_type {
        return Err(FatError::InvalidParameter("disk size does not suit the requested FAT type"));
    }
    Ok(parsed)
}

fn clear_sectors<D: BlockDevice>(disk: &Disk<D>, count: u32) -> Result<()> {
    let chunk = count.min(CLEAR_CHUNK_SECTORS);
    if chunk == 0 {
        return Ok(());
    }
    let zeros = vec![0u8; chunk as usize * 512];

    let mut lba = 0;
    while lba < count {
        let n = (count - lba).min(chunk);
        disk.write(lba as u64, n, &zeros[..n as usize * 512])?;
        lba += n;
    }
    Ok(())
}

/// FAT entries 0 and 1 (media byte, end of chain), and on FAT32 the root
/// cluster's terminal entry, in the first FAT sector
fn write_reserved_entries(params: &VolumeParameters, sector: &mut [u8]) {
    let media = params.media_type;
    match params.fs_type {
        FatType::Fat12 => {
            sector[0] = media;
            sector[1] = 0xFF;
            sector[2] = 0xFF;
        }
        FatType::Fat16 => {
            sector[0] = media;
            sector[1] = 0xFF;
            sector[2] = 0xFF;
            sector[3] = 0xFF;
        }
        FatType::Fat32 => {
            put32(sector, 0, 0x0FFF_FF00 | media as u32);
            put32(sector, 4, cluster_values::CLUSTER_MASK);
            put32(sector, FAT32_ROOT_CLUSTER as usize * 4, params.terminal_cluster);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::cache::FatCache;
    use crate::fs::fat::table::FatTable;
    use crate::io::ramdisk::RamDisk;

    fn formatted(sectors: u64, options: FormatOptions) -> (Disk<RamDisk>, VolumeParameters) {
        let disk = Disk::new(RamDisk::new(sectors, 512));
        let params = format(&disk, &options).unwrap();
        (disk, params)
    }

    #[test]
    fn test_type_chosen_by_size() {
        let (_, p) = formatted(2880, FormatOptions::new());
        assert_eq!(p.fs_type, FatType::Fat12);
        assert_eq!(p.root_dir_entries, 224);
        assert_eq!(p.sectors_per_cluster, 1);

        let (_, p) = formatted(20000, FormatOptions::new());
        assert_eq!(p.fs_type, FatType::Fat16);
        assert_eq!(p.root_dir_entries, 512);
        assert_eq!(p.sectors_per_cluster, 2);

        let (_, p) = formatted(66600, FormatOptions::new().with_label("big disk"));
        assert_eq!(p.fs_type, FatType::Fat32);
        assert_eq!(p.reserved_sectors, 32);
        assert_eq!(p.root_dir_cluster(), 2);
        assert_eq!(p.label(), "BIG DISK");
    }

    #[test]
    fn test_fat12_doubles_cluster_size() {
        let (_, p) = formatted(8000, FormatOptions::new());
        assert_eq!(p.fs_type, FatType::Fat12);
        assert_eq!(p.sectors_per_cluster, 2);
        assert!(p.data_clusters < 4085);
    }

    #[test]
    fn test_forced_type_must_fit() {
        let disk = Disk::new(RamDisk::new(5000, 512));
        let err = format(&disk, &FormatOptions::new().with_type(FatType::Fat16));
        assert!(matches!(err, Err(FatError::InvalidParameter(_))));

        let disk = Disk::new(RamDisk::new(20000, 512));
        let err = format(&disk, &FormatOptions::new().with_type(FatType::Fat32));
        assert!(matches!(err, Err(FatError::InvalidParameter(_))));

        let disk = Disk::new(RamDisk::new(2880, 1024));
        assert!(format(&disk, &FormatOptions::new()).is_err());
    }

    #[test]
    fn test_fresh_fat_is_empty() {
        let (disk, p) = formatted(20000, FormatOptions::new().with_volume_id(0xBEEF));
        assert_eq!(p.volume_id, 0xBEEF);
        assert_eq!(p.media_type, 0xF8);

        let mut cache = FatCache::new(&p, 8);
        let mut fat = FatTable::new(&p, &disk, &mut cache);
        assert_eq!(fat.get_entry(2).unwrap(), 0);
        assert_eq!(fat.get_entry(p.max_cluster()).unwrap(), 0);
    }

    #[test]
    fn test_fat32_root_and_fs_info() {
        let (disk, p) = formatted(66600, FormatOptions::new());
        let mut cache = FatCache::new(&p, 8);
        let mut fat = FatTable::new(&p, &disk, &mut cache);
        assert_eq!(fat.next_cluster(2).unwrap(), None);
        assert_eq!(fat.get_entry(3).unwrap(), 0);

        let mut sector = vec![0u8; 512];
        disk.read(1, 1, &mut sector).unwrap();
        let info = FsInfo::parse(&sector, p.data_clusters).unwrap();
        assert_eq!(info.free_cluster_count, p.data_clusters - 1);
        assert_eq!(info.next_free_cluster, 3);

        let mut backup = vec![0u8; 512];
        disk.read(6, 1, &mut backup).unwrap();
        assert_eq!(VolumeParameters::parse(&backup, 512).unwrap(), p);
    }

    #[test]
    fn test_removable_media_byte() {
        let disk = Disk::new(RamDisk::new(2880, 512).removable());
        let p = format(&disk, &FormatOptions::new()).unwrap();
        assert_eq!(p.media_type, 0xF0);
        assert_eq!(p.drive_number, 0);
    }
}
