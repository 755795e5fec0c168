//! Cluster chain consistency check
//!
//! Walks the directory tree of a mounted volume and compares the size of
//! every entry with the cluster chain it owns:
//!
//! - an empty entry that owns clusters has them released
//! - an entry with a size but no clusters is cut to size 0
//! - a chain whose length disagrees with the size keeps its clusters and
//!   the size is set from the chain
//! - a chain with a bad link is terminated at the last good cluster
//!
//! Directories holding a repaired entry are written back. Directories not
//! read yet are read on the way.

use crate::fs::vfs::{EntryId, EntryTree};
use crate::io::block::BlockDevice;
use super::error::{FatError, Result};
use super::table::FatTable;
use super::volume::{lookup_entry, lookup_entry_mut, FatVolume};

/// Findings of [`FatVolume::check_volume`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Entries examined, "." and ".." excluded
    pub entries_checked: u32,
    pub problems: u32,
    pub repaired: u32,
    /// Chains that could not be followed at all
    pub unrepairable: u32,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems == 0
    }
}

/// Result of following a chain as far as it is sound
struct ChainWalk {
    clusters: u32,
    last: u32,
    broken: bool,
}

fn walk_chain<D: BlockDevice>(fat: &mut FatTable<'_, D>, start: u32) -> ChainWalk {
    if !fat.params().is_valid_cluster(start) {
        return ChainWalk { clusters: 0, last: 0, broken: true };
    }

    let limit = fat.params().data_clusters;
    let mut walk = ChainWalk { clusters: 1, last: start, broken: false };
    loop {
        match fat.next_cluster(walk.last) {
            Ok(Some(next)) if walk.clusters < limit => {
                walk.clusters += 1;
                walk.last = next;
            }
            Ok(None) => return walk,
            _ => {
                walk.broken = true;
                return walk;
            }
        }
    }
}

enum Outcome {
    Clean,
    Problem { repaired: bool },
}

impl<D: BlockDevice + 'static> FatVolume<D> {
    /// Check every cluster chain below the root.
    ///
    /// Without `repair`, any problem fails with `Structural` after the
    /// whole tree was examined. With `repair`, the report is returned even
    /// if some chains could not be fixed.
    pub fn check_volume<T: EntryTree + ?Sized>(&self, tree: &mut T, repair: bool) -> Result<CheckReport> {
        self.ensure_mounted()?;
        self.check_media()?;

        let mut report = CheckReport::default();
        self.check_directory(tree, self.root(), repair, &mut report)?;
        if report.repaired > 0 {
            self.flush_fat()?;
        }

        log::info!(
            target: "fatfs",
            "check of volume {:08X}: {} entries, {} problems, {} repaired",
            self.params().volume_id,
            report.entries_checked,
            report.problems,
            report.repaired
        );

        if !repair && !report.is_clean() {
            return Err(FatError::Structural("cluster chains disagree with entry sizes"));
        }
        Ok(report)
    }

    fn check_directory<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        dir: EntryId,
        repair: bool,
        report: &mut CheckReport,
    ) -> Result<()> {
        if dir != self.root() && tree.children(dir).is_empty() {
            self.read_dir(tree, dir)?;
        }

        let mut changed = false;
        for child in tree.children(dir) {
            let entry = lookup_entry(tree, child)?;
            if entry.is_dot() {
                continue;
            }
            let is_directory = entry.is_directory();

            report.entries_checked += 1;
            match self.check_entry(tree, child, repair, report)? {
                Outcome::Clean if is_directory => {
                    self.check_directory(tree, child, repair, report)?;
                }
                Outcome::Clean => {}
                Outcome::Problem { repaired } => {
                    report.problems += 1;
                    if repaired {
                        report.repaired += 1;
                        changed = true;
                    }
                }
            }
        }

        if changed {
            if let Err(err) = self.write_dir(tree, dir) {
                log::warn!(target: "fatfs", "could not write repaired directory: {}", err);
            }
        }
        Ok(())
    }

    fn check_entry<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        repair: bool,
        report: &mut CheckReport,
    ) -> Result<Outcome> {
        let cluster_size = self.params().cluster_size() as u64;
        let start = self.entry_data(tree, id)?.start_cluster;
        let entry = lookup_entry(tree, id)?;

        // Directory sizes are derived from the chain
        let is_directory = entry.is_directory();
        if !is_directory && entry.size == 0 {
            if start == 0 {
                return Ok(Outcome::Clean);
            }
            log::warn!(target: "fatfs", "empty file {:?} owns clusters", entry.name);
            if !repair {
                return Ok(Outcome::Problem { repaired: false });
            }
            let released = self.with_allocator(|map, fat| map.release_chain(fat, start));
            if let Err(err) = released {
                log::warn!(target: "fatfs", "releasing clusters failed: {}", err);
                return Ok(Outcome::Problem { repaired: false });
            }
            self.update_data(tree, id, |d| d.start_cluster = 0)?;
            lookup_entry_mut(tree, id)?.blocks = 0;
            return Ok(Outcome::Problem { repaired: true });
        }

        if start == 0 {
            log::warn!(target: "fatfs", "{:?} has {} bytes but no clusters", entry.name, entry.size);
            if repair {
                let entry = lookup_entry_mut(tree, id)?;
                entry.size = 0;
                entry.blocks = 0;
            }
            return Ok(Outcome::Problem { repaired: repair });
        }

        let walk = self.with_fat(|fat| Ok(walk_chain(fat, start)))?;
        if walk.clusters == 0 {
            log::error!(target: "fatfs", "{:?} starts at invalid cluster {}", entry.name, start);
            report.unrepairable += 1;
            return Ok(Outcome::Problem { repaired: false });
        }

        let nominal = if is_directory {
            walk.clusters as u64
        } else {
            entry.size.div_ceil(cluster_size)
        };
        if !walk.broken && walk.clusters as u64 == nominal {
            if entry.blocks != walk.clusters {
                lookup_entry_mut(tree, id)?.blocks = walk.clusters;
            }
            return Ok(Outcome::Clean);
        }

        log::warn!(
            target: "fatfs",
            "{:?}: nominal cluster count {}, actual {}{}",
            entry.name,
            nominal,
            walk.clusters,
            if walk.broken { " up to a bad link" } else { "" }
        );
        if !repair {
            return Ok(Outcome::Problem { repaired: false });
        }

        if walk.broken {
            let terminated = self.with_fat(|fat| {
                let terminal = fat.params().terminal_cluster;
                fat.set_entry(walk.last, terminal)
            });
            if let Err(err) = terminated {
                log::warn!(target: "fatfs", "could not terminate chain: {}", err);
                return Ok(Outcome::Problem { repaired: false });
            }
        }

        let entry = lookup_entry_mut(tree, id)?;
        entry.blocks = walk.clusters;
        entry.size = walk.clusters as u64 * cluster_size;
        Ok(Outcome::Problem { repaired: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::config::FatConfig;
    use crate::fs::fat::format::{format, FormatOptions};
    use crate::fs::fat::volume::InlineSpawner;
    use crate::fs::vfs::{EntryArena, FileEntry, FileType};
    use crate::io::block::Disk;
    use crate::io::ramdisk::RamDisk;
    use alloc::sync::Arc;
    use alloc::vec;

    type Volume = Arc<FatVolume<RamDisk>>;

    fn mounted(disk: Disk<RamDisk>) -> (Volume, EntryArena) {
        let mut tree = EntryArena::new();
        let root = tree.root();
        let volume = FatVolume::mount(disk, FatConfig::new(), &InlineSpawner, &mut tree, root).unwrap();
        (volume, tree)
    }

    fn fresh() -> (Volume, EntryArena) {
        let disk = Disk::new(RamDisk::new(20000, 512));
        format(&disk, &FormatOptions::new()).unwrap();
        mounted(disk)
    }

    fn remount(volume: Volume) -> (Volume, EntryArena) {
        volume.unmount().unwrap();
        match Arc::try_unwrap(volume) {
            Ok(volume) => mounted(volume.into_disk()),
            Err(_) => panic!("volume still shared"),
        }
    }

    fn add(volume: &Volume, tree: &mut EntryArena, parent: EntryId, name: &str, file_type: FileType) -> EntryId {
        let id = tree.new_entry().unwrap();
        *tree.entry_mut(id).unwrap() = FileEntry::new(name, file_type);
        assert!(tree.insert_entry(id, parent));
        volume.new_entry(tree, id).unwrap();
        if file_type == FileType::Directory {
            volume.make_dir(tree, id).unwrap();
        } else {
            volume.create_file(tree, id).unwrap();
        }
        id
    }

    fn write_clusters(volume: &Volume, tree: &mut EntryArena, id: EntryId, count: u32) {
        let len = count as usize * volume.params().cluster_size() as usize;
        volume.write_file(tree, id, 0, count, &vec![0x5A; len]).unwrap();
    }

    #[test]
    fn test_clean_volume_reads_subdirectories() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let dir = add(&volume, &mut tree, root, "projects", FileType::Directory);
        let file = add(&volume, &mut tree, dir, "plan.txt", FileType::Regular);
        write_clusters(&volume, &mut tree, file, 2);
        let other = add(&volume, &mut tree, root, "empty.txt", FileType::Regular);
        assert_eq!(tree.entry(other).unwrap().size, 0);
        volume.write_dir(&mut tree, dir).unwrap();
        volume.write_dir(&mut tree, root).unwrap();

        let (volume, mut tree) = remount(volume);
        let dir = tree.lookup(tree.root(), "projects").unwrap();
        assert!(tree.children(dir).is_empty());

        let report = volume.check_volume(&mut tree, false).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.entries_checked, 3);
        assert!(tree.lookup(dir, "plan.txt").is_some());
    }

    #[test]
    fn test_size_disagreeing_with_chain() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let cluster_size = volume.params().cluster_size() as u64;
        let file = add(&volume, &mut tree, root, "report.doc", FileType::Regular);
        write_clusters(&volume, &mut tree, file, 3);
        tree.entry_mut(file).unwrap().size = 10;
        volume.write_dir(&mut tree, root).unwrap();

        assert!(matches!(volume.check_volume(&mut tree, false), Err(FatError::Structural(_))));
        assert_eq!(tree.entry(file).unwrap().size, 10);

        let report = volume.check_volume(&mut tree, true).unwrap();
        assert_eq!(report.problems, 1);
        assert_eq!(report.repaired, 1);
        let entry = tree.entry(file).unwrap();
        assert_eq!(entry.blocks, 3);
        assert_eq!(entry.size, 3 * cluster_size);

        // The repaired size was written back
        let (volume, mut tree) = remount(volume);
        let file = tree.lookup(tree.root(), "report.doc").unwrap();
        assert_eq!(tree.entry(file).unwrap().size, 3 * cluster_size);
        assert!(volume.check_volume(&mut tree, false).unwrap().is_clean());
    }

    #[test]
    fn test_empty_file_owning_clusters() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let free = volume.free_bytes().unwrap();
        let file = add(&volume, &mut tree, root, "ghost.bin", FileType::Regular);
        write_clusters(&volume, &mut tree, file, 4);
        tree.entry_mut(file).unwrap().size = 0;

        let report = volume.check_volume(&mut tree, true).unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(volume.entry_data(&tree, file).unwrap().start_cluster, 0);
        assert_eq!(tree.entry(file).unwrap().blocks, 0);
        assert_eq!(volume.free_bytes().unwrap(), free);
    }

    #[test]
    fn test_size_without_clusters() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let file = add(&volume, &mut tree, root, "hollow.txt", FileType::Regular);
        tree.entry_mut(file).unwrap().size = 100;

        let report = volume.check_volume(&mut tree, true).unwrap();
        assert_eq!(report.problems, 1);
        assert_eq!(tree.entry(file).unwrap().size, 0);
        assert!(volume.check_volume(&mut tree, false).unwrap().is_clean());
    }

    #[test]
    fn test_bad_link_terminates_chain() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let cluster_size = volume.params().cluster_size() as u64;
        let file = add(&volume, &mut tree, root, "torn.dat", FileType::Regular);
        write_clusters(&volume, &mut tree, file, 3);
        let start = volume.entry_data(&tree, file).unwrap().start_cluster;

        // Second cluster links outside the data area
        volume.with_fat(|fat| fat.set_entry(start + 1, 1)).unwrap();

        let report = volume.check_volume(&mut tree, true).unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(tree.entry(file).unwrap().size, 2 * cluster_size);
        assert_eq!(volume.with_fat(|fat| fat.num_clusters(start)).unwrap(), 2);
    }

    #[test]
    fn test_invalid_start_cluster_is_unrepairable() {
        let (volume, mut tree) = fresh();
        let root = tree.root();
        let file = add(&volume, &mut tree, root, "lost.dat", FileType::Regular);
        tree.entry_mut(file).unwrap().size = 1;
        let beyond = volume.params().max_cluster() + 1;
        volume.update_data(&tree, file, |d| d.start_cluster = beyond).unwrap();

        let report = volume.check_volume(&mut tree, true).unwrap();
        assert_eq!(report.unrepairable, 1);
        assert_eq!(report.repaired, 0);
        assert!(!report.is_clean());
    }
}
