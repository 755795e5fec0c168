//! Mounted FAT volume
//!
//! [`FatVolume`] is the per-volume context the VFS calls into. It owns the
//! disk, the parsed boot sector, the FAT sector cache, the free cluster map
//! and the entry-data pool; nothing is shared between volumes.
//!
//! # Volume States
//!
//! ```text
//! Unmounted -> Mounting -> Mounted <-> Syncing
//!                  │          │
//!                  └──────────┴──> Faulted
//! ```
//!
//! Every operation except [`FatVolume::mount`] needs the volume mounted.
//!
//! # Locking
//!
//! - **free map**: held across every allocate/release sequence and for the
//!   whole free map build
//! - **cache**: held while FAT entries are read or written
//! - **pool**: held only to copy entry data in or out
//!
//! The free map lock is always taken before the cache lock. The device
//! lock is taken per transfer inside [`Disk`].
//!
//! # Removable Media
//!
//! Before any operation that touches file or directory data the disk-changed
//! line is sampled. When it is set, sector 0 is read again and its volume id
//! compared with the mounted one. A mismatch latches the volume: every later
//! data operation fails with `MediaChanged` until it is mounted again.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

use crate::fs::vfs::{EntryHandle, EntryId, EntryTree, FileEntry, FileType};
use crate::io::block::{BlockDevice, Disk};
use super::alias::{self, DOTDOT_ALIAS, DOT_ALIAS};
use super::bitmap::FreeMap;
use super::bpb::{self, FsInfo, VolumeParameters};
use super::cache::FatCache;
use super::config::FatConfig;
use super::dir::{self, DirRecord, FatAttributes, DIR_ENTRY_SIZE};
use super::error::{FatError, Resource, Result};
use super::le32;
use super::pool::{EntryPool, FatEntryData};
use super::table::{self, Extent, FatTable};

// ============================================================================
// Background Work
// ============================================================================

/// Runs detached work on behalf of a volume
pub trait TaskSpawner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs each task to completion on the calling thread
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

// ============================================================================
// Volume State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeState {
    Unmounted = 0,
    Mounting = 1,
    Mounted = 2,
    Syncing = 3,
    /// An unrecoverable parse or I/O error ended the mount
    Faulted = 4,
}

impl VolumeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => VolumeState::Mounting,
            2 => VolumeState::Mounted,
            3 => VolumeState::Syncing,
            4 => VolumeState::Faulted,
            _ => VolumeState::Unmounted,
        }
    }
}

/// Short alias recorded for the root entry; never written to disk
const ROOT_ALIAS: [u8; 11] = *b"/          ";

fn read_boot_sector<D: BlockDevice>(disk: &Disk<D>) -> Result<Vec<u8>> {
    let mut sector = vec![0u8; disk.sector_size() as usize];
    disk.read(0, 1, &mut sector)?;
    Ok(sector)
}

pub(super) fn lookup_entry<T: EntryTree + ?Sized>(tree: &T, id: EntryId) -> Result<&FileEntry> {
    tree.entry(id).ok_or(FatError::InvalidParameter("no such file entry"))
}

pub(super) fn lookup_entry_mut<T: EntryTree + ?Sized>(tree: &mut T, id: EntryId) -> Result<&mut FileEntry> {
    tree.entry_mut(id).ok_or(FatError::InvalidParameter("no such file entry"))
}

fn handle_of<T: EntryTree + ?Sized>(tree: &T, id: EntryId) -> Result<EntryHandle> {
    lookup_entry(tree, id)?
        .fs_data
        .ok_or(FatError::Structural("file entry has no FAT data"))
}

// ============================================================================
// FAT Volume
// ============================================================================

/// One mounted FAT volume
pub struct FatVolume<D: BlockDevice> {
    disk: Disk<D>,
    params: VolumeParameters,
    config: FatConfig,
    /// Entry the volume root was mounted on
    root: EntryId,
    state: AtomicU8,
    free_map: Mutex<FreeMap>,
    cache: Mutex<FatCache>,
    pool: Mutex<EntryPool>,
    /// Latched once a media swap was seen
    media_changed: AtomicBool,
}

impl<D: BlockDevice + 'static> FatVolume<D> {
    /// Quick check whether `disk` holds a FAT volume
    pub fn detect(disk: &Disk<D>) -> bool {
        match read_boot_sector(disk) {
            Ok(sector) => bpb::detect(&sector, disk.sector_size()),
            Err(_) => false,
        }
    }

    /// Detect and fully validate the boot sector without mounting
    pub fn check(disk: &Disk<D>) -> Result<VolumeParameters> {
        let sector = read_boot_sector(disk)?;
        if !bpb::detect(&sector, disk.sector_size()) {
            return Err(FatError::Validation("not a FAT volume"));
        }
        VolumeParameters::parse(&sector, disk.sector_size())
    }

    /// Mount the volume on `disk` with its root directory read into `root`.
    ///
    /// The free cluster map is built by a task handed to `spawner`; until
    /// it finishes, allocations build the map themselves under the same
    /// lock. On failure everything allocated for the mount is released.
    pub fn mount<T: EntryTree + ?Sized>(
        disk: Disk<D>,
        config: FatConfig,
        spawner: &dyn TaskSpawner,
        tree: &mut T,
        root: EntryId,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let sector = read_boot_sector(&disk)?;
        let params = VolumeParameters::parse(&sector, disk.sector_size())?;

        if let Some(ext) = params.fat32 {
            read_fs_info(&disk, &params, ext.fs_info_sector)?;
        }

        let mut cache = FatCache::new(&params, config.fat_cache_sectors);
        cache.preload(&disk)?;

        let volume = Arc::new(FatVolume {
            disk,
            params,
            config,
            root,
            state: AtomicU8::new(VolumeState::Mounting as u8),
            free_map: Mutex::new(FreeMap::new()),
            cache: Mutex::new(cache),
            pool: Mutex::new(EntryPool::new(config.max_entry_data)),
            media_changed: AtomicBool::new(false),
        });

        let builder = Arc::clone(&volume);
        spawner.spawn(Box::new(move || builder.build_free_map()));

        if let Err(err) = volume.mount_root(tree) {
            log::error!(target: "fatfs", "mount failed: {}", err);
            for child in tree.children(root) {
                tree.release_entry(child);
            }
            if let Some(entry) = tree.entry_mut(root) {
                entry.fs_data = None;
            }
            volume.release_memory();
            volume.set_state(VolumeState::Faulted);
            return Err(err);
        }

        let p = &volume.params;
        log::info!(
            target: "fatfs",
            "mounted {:?} volume {:08X} \"{}\": {} clusters of {} bytes",
            p.fs_type,
            p.volume_id,
            p.label(),
            p.data_clusters,
            p.cluster_size()
        );
        Ok(volume)
    }

    fn mount_root<T: EntryTree + ?Sized>(&self, tree: &mut T) -> Result<()> {
        let handle = self.attach(tree, self.root)?;
        let start = self.params.root_dir_cluster();
        *self.pool.lock().get_mut(handle)? = FatEntryData {
            short_alias: ROOT_ALIAS,
            attributes: FatAttributes::DIRECTORY | FatAttributes::SYSTEM,
            start_cluster: start,
            ..FatEntryData::default()
        };

        let (blocks, size) = if start == 0 {
            let sectors = self.params.root_dir_sectors;
            (
                sectors.div_ceil(self.params.sectors_per_cluster),
                self.params.root_dir_entries as u64 * DIR_ENTRY_SIZE as u64,
            )
        } else {
            let blocks = self.with_fat(|fat| fat.num_clusters(start))?;
            (blocks, blocks as u64 * self.params.cluster_size() as u64)
        };

        let entry = lookup_entry_mut(tree, self.root)?;
        entry.file_type = FileType::Directory;
        entry.blocks = blocks;
        entry.size = size;

        self.set_state(VolumeState::Mounted);
        self.read_dir(tree, self.root)
    }

    /// Background task body
    fn build_free_map(&self) {
        if !self.may_build_free_map() {
            return;
        }

        let mut map = self.free_map.lock();
        // A failed mount or an unmount may have released the volume while
        // this task waited for the lock
        if !self.may_build_free_map() {
            return;
        }
        let mut cache = self.cache.lock();
        let mut fat = FatTable::new(&self.params, &self.disk, &mut *cache);
        if let Err(err) = map.build(&mut fat) {
            log::error!(target: "fatfs", "building the free cluster map failed: {}", err);
        }
    }

    fn may_build_free_map(&self) -> bool {
        matches!(
            self.state(),
            VolumeState::Mounting | VolumeState::Mounted | VolumeState::Syncing
        )
    }

    pub fn params(&self) -> &VolumeParameters {
        &self.params
    }

    pub fn config(&self) -> &FatConfig {
        &self.config
    }

    pub fn disk(&self) -> &Disk<D> {
        &self.disk
    }

    /// Entry the root directory was mounted on
    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn state(&self) -> VolumeState {
        VolumeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: VolumeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Give the disk back once nothing else holds the volume
    pub fn into_disk(self) -> Disk<D> {
        self.disk
    }

    pub(super) fn ensure_mounted(&self) -> Result<()> {
        match self.state() {
            VolumeState::Mounted | VolumeState::Syncing => Ok(()),
            _ => Err(FatError::NotMounted),
        }
    }

    // ------------------------------------------------------------------------
    // FAT access
    // ------------------------------------------------------------------------

    pub(super) fn with_fat<R>(&self, f: impl FnOnce(&mut FatTable<'_, D>) -> Result<R>) -> Result<R> {
        let mut cache = self.cache.lock();
        let mut fat = FatTable::new(&self.params, &self.disk, &mut *cache);
        f(&mut fat)
    }

    /// Run `f` under the free map lock. Builds the map first if the
    /// background task has not done so yet.
    pub(super) fn with_allocator<R>(
        &self,
        f: impl FnOnce(&mut FreeMap, &mut FatTable<'_, D>) -> Result<R>,
    ) -> Result<R> {
        let mut map = self.free_map.lock();
        let mut cache = self.cache.lock();
        let mut fat = FatTable::new(&self.params, &self.disk, &mut *cache);
        if !map.is_ready() {
            map.build(&mut fat)?;
        }
        f(&mut *map, &mut fat)
    }

    pub(super) fn flush_fat(&self) -> Result<()> {
        self.cache.lock().flush(&self.disk)
    }

    /// Make the chain at `start` at least `need` clusters long.
    ///
    /// Returns the (possibly new) first cluster and the chain length.
    fn grow_chain(&self, start: u32, need: u32) -> Result<(u32, u32)> {
        self.with_allocator(|map, fat| {
            let existing = fat.num_clusters(start)?;
            if existing >= need {
                return Ok((start, existing));
            }

            let added = map.allocate(fat, need - existing)?;
            if start == 0 {
                return Ok((added, need));
            }

            let linked = match fat.last_cluster(start) {
                Ok(last) => fat.set_entry(last, added),
                Err(err) => Err(err),
            };
            if let Err(err) = linked {
                if let Err(undo) = map.release_chain(fat, added) {
                    log::warn!(target: "fatfs", "releasing unlinked clusters failed: {}", undo);
                }
                return Err(err);
            }
            Ok((start, need))
        })
    }

    fn read_chain(&self, start: u32) -> Result<Vec<u8>> {
        let extents = self.with_fat(|fat| {
            let clusters = fat.num_clusters(start)?;
            fat.extents(start, 0, clusters)
        })?;
        let clusters: u32 = extents.iter().map(|e| e.count).sum();

        let mut raw = vec![0u8; clusters as usize * self.params.cluster_size() as usize];
        table::read_extents(&self.disk, &self.params, &extents, &mut raw)?;
        Ok(raw)
    }

    fn write_chain(&self, start: u32, skip: u32, count: u32, buf: &[u8]) -> Result<()> {
        let extents = self.with_fat(|fat| fat.extents(start, skip, count))?;
        table::write_extents(&self.disk, &self.params, &extents, buf)?;
        self.flush_fat()
    }

    // ------------------------------------------------------------------------
    // Entry data
    // ------------------------------------------------------------------------

    fn attach<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<EntryHandle> {
        let entry = lookup_entry_mut(tree, id)?;
        if entry.fs_data.is_some() {
            return Err(FatError::InvalidParameter("file entry already has FAT data"));
        }
        let handle = self.pool.lock().attach()?;
        entry.fs_data = Some(handle);
        Ok(handle)
    }

    fn detach<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        let entry = lookup_entry_mut(tree, id)?;
        match entry.fs_data.take() {
            Some(handle) => self.pool.lock().release(handle),
            None => Ok(()),
        }
    }

    /// FAT private data of an entry
    pub fn entry_data<T: EntryTree + ?Sized>(&self, tree: &T, id: EntryId) -> Result<FatEntryData> {
        let handle = handle_of(tree, id)?;
        let data = *self.pool.lock().get(handle)?;
        Ok(data)
    }

    pub(super) fn update_data<T: EntryTree + ?Sized>(
        &self,
        tree: &T,
        id: EntryId,
        f: impl FnOnce(&mut FatEntryData),
    ) -> Result<()> {
        let handle = handle_of(tree, id)?;
        let mut pool = self.pool.lock();
        f(pool.get_mut(handle)?);
        Ok(())
    }

    /// Alias for `id` that no other child of its parent uses
    fn unique_alias<T: EntryTree + ?Sized>(&self, tree: &T, id: EntryId) -> Result<[u8; 11]> {
        let entry = lookup_entry(tree, id)?;
        let siblings: Vec<[u8; 11]> = match entry.parent {
            Some(parent) => {
                let pool = self.pool.lock();
                tree.children(parent)
                    .into_iter()
                    .filter(|&child| child != id)
                    .filter_map(|child| tree.entry(child).and_then(|e| e.fs_data))
                    .filter_map(|handle| pool.get(handle).ok().map(|d| d.short_alias))
                    .collect()
            }
            None => Vec::new(),
        };
        alias::make_short_alias(&entry.name, &siblings)
    }

    // ------------------------------------------------------------------------
    // Consistency checks
    // ------------------------------------------------------------------------

    pub(super) fn check_media(&self) -> Result<()> {
        if self.media_changed.load(Ordering::Acquire) {
            return Err(FatError::MediaChanged);
        }
        if !self.disk.media_changed() {
            return Ok(());
        }

        let offset = self.params.volume_id_offset();
        let current = read_boot_sector(&self.disk).ok().map(|s| le32(&s, offset));
        if current == Some(self.params.volume_id) {
            log::debug!(target: "fatfs", "disk change line set, same volume still present");
            return Ok(());
        }

        self.media_changed.store(true, Ordering::Release);
        log::warn!(
            target: "fatfs",
            "media changed under mounted volume {:08X}",
            self.params.volume_id
        );
        Err(FatError::MediaChanged)
    }

    /// The chain must hold exactly the clusters the size calls for.
    /// Returns the chain length.
    fn check_file_chain(&self, entry: &FileEntry, start: u32) -> Result<u32> {
        if start == 0 {
            if entry.size > 0 {
                log::warn!(target: "fatfs", "{:?} has {} bytes but no clusters", entry.name, entry.size);
                return Err(FatError::Structural("file has a size but no clusters"));
            }
            return Ok(0);
        }

        let actual = self.with_fat(|fat| fat.num_clusters(start))?;
        let expected = entry.size.div_ceil(self.params.cluster_size() as u64);
        if expected != actual as u64 {
            log::warn!(
                target: "fatfs",
                "{:?}: chain has {} clusters, size needs {}",
                entry.name,
                actual,
                expected
            );
            return Err(FatError::Structural("cluster chain length disagrees with file size"));
        }
        Ok(actual)
    }

    pub(super) fn is_fixed_root(&self, dir: EntryId) -> bool {
        self.params.fat32.is_none() && dir == self.root
    }

    fn transfer_len(&self, count: u32, available: usize) -> Result<usize> {
        let len = count as usize * self.params.cluster_size() as usize;
        if available < len {
            return Err(FatError::InvalidParameter("buffer smaller than the transfer"));
        }
        Ok(len)
    }

    // ------------------------------------------------------------------------
    // Volume operations
    // ------------------------------------------------------------------------

    /// Write the allocator state into FSInfo (FAT32) and flush every dirty
    /// FAT sector
    pub fn sync(&self) -> Result<()> {
        self.ensure_mounted()?;
        self.set_state(VolumeState::Syncing);

        let info = match self.params.fat32 {
            Some(ext) => self.write_fs_info(ext.fs_info_sector),
            None => Ok(()),
        };
        let fat = self.flush_fat();
        let device = self.disk.flush().map_err(FatError::from);

        self.set_state(VolumeState::Mounted);
        info.and(fat).and(device)
    }

    fn write_fs_info(&self, sector: u32) -> Result<()> {
        let info = {
            let map = self.free_map.lock();
            if !map.is_ready() {
                return Ok(());
            }
            FsInfo {
                free_cluster_count: map.free_clusters(),
                next_free_cluster: FsInfo::next_free_hint(map.first_free(), self.params.data_clusters),
            }
        };

        let mut buf = vec![0u8; self.params.bytes_per_sector as usize];
        self.disk.read(sector as u64, 1, &mut buf)?;
        info.patch(&mut buf);
        self.disk.write(sector as u64, 1, &buf)?;
        log::debug!(
            target: "fatfs",
            "FSInfo: {} free, next free {}",
            info.free_cluster_count,
            info.next_free_cluster
        );
        Ok(())
    }

    /// Sync and release every in-memory structure of the volume.
    ///
    /// A failed sync is reported, but the memory is released and the
    /// volume unmounted regardless.
    pub fn unmount(&self) -> Result<()> {
        self.ensure_mounted()?;

        let result = self.sync();
        if let Err(err) = result {
            log::warn!(target: "fatfs", "sync during unmount failed: {}", err);
        }

        self.release_memory();
        self.set_state(VolumeState::Unmounted);
        log::info!(target: "fatfs", "unmounted volume {:08X}", self.params.volume_id);
        result
    }

    fn release_memory(&self) {
        self.free_map.lock().clear();
        self.cache.lock().clear();
        self.pool.lock().clear();
    }

    /// Free space in bytes. Waits for the free map if it is still being
    /// built.
    pub fn free_bytes(&self) -> Result<u64> {
        self.ensure_mounted()?;
        let free = self.with_allocator(|map, _| Ok(map.free_clusters()))?;
        Ok(free as u64 * self.params.cluster_size() as u64)
    }

    /// Attach FAT private data to a fresh entry
    pub fn new_entry<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        self.attach(tree, id).map(|_| ())
    }

    /// Release the private data of an entry the VFS no longer uses
    pub fn inactive_entry<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        self.detach(tree, id)
    }

    /// Read `count` clusters of a file, starting at cluster `start_block`.
    /// Returns the number of clusters read.
    pub fn read_file<T: EntryTree + ?Sized>(
        &self,
        tree: &T,
        id: EntryId,
        start_block: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<u32> {
        self.ensure_mounted()?;
        if count == 0 {
            return Ok(0);
        }

        let entry = lookup_entry(tree, id)?;
        if entry.file_type != FileType::Regular {
            return Err(FatError::InvalidParameter("not a regular file"));
        }
        let len = self.transfer_len(count, buf.len())?;
        self.check_media()?;

        let data = self.entry_data(tree, id)?;
        let clusters = self.check_file_chain(entry, data.start_cluster)?;
        if start_block.checked_add(count).map_or(true, |end| end > clusters) {
            return Err(FatError::InvalidParameter("read past the end of the file"));
        }

        let extents = self.with_fat(|fat| fat.extents(data.start_cluster, start_block, count))?;
        table::read_extents(&self.disk, &self.params, &extents, &mut buf[..len])?;

        log::debug!(
            target: "fatfs",
            "read {:?}: {} clusters at {} in {} transfer run(s)",
            entry.name,
            count,
            start_block,
            extents.len()
        );
        Ok(count)
    }

    /// Write `count` clusters of a file, starting at cluster `start_block`,
    /// growing the chain as needed. Returns the number of clusters written.
    ///
    /// `blocks` is set to the chain length. `size` is left alone while it
    /// still matches the chain, otherwise set to whole clusters; the caller
    /// trims it to the byte.
    pub fn write_file<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        start_block: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<u32> {
        self.ensure_mounted()?;
        if count == 0 {
            return Ok(0);
        }

        let entry = lookup_entry(tree, id)?;
        if entry.file_type != FileType::Regular {
            return Err(FatError::InvalidParameter("not a regular file"));
        }
        let len = self.transfer_len(count, buf.len())?;
        let need = start_block
            .checked_add(count)
            .ok_or(FatError::InvalidParameter("write past the largest file"))?;
        self.check_media()?;

        let data = self.entry_data(tree, id)?;
        self.check_file_chain(entry, data.start_cluster)?;

        let (start, total) = self.grow_chain(data.start_cluster, need)?;
        if start != data.start_cluster {
            self.update_data(tree, id, |d| d.start_cluster = start)?;
        }

        let cluster_size = self.params.cluster_size() as u64;
        let entry = lookup_entry_mut(tree, id)?;
        entry.blocks = total;
        if entry.size.div_ceil(cluster_size) != total as u64 {
            entry.size = total as u64 * cluster_size;
        }

        self.write_chain(start, start_block, count, &buf[..len])?;
        Ok(count)
    }

    /// Validate the name of a new entry and give it a short alias
    pub fn create_file<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;

        let entry = lookup_entry(tree, id)?;
        if entry.is_dot() {
            return Ok(());
        }
        alias::check_filename(&entry.name)?;

        let short_alias = self.unique_alias(tree, id)?;
        self.update_data(tree, id, |d| {
            d.short_alias = short_alias;
            d.attributes |= FatAttributes::ARCHIVE;
        })?;
        log::debug!(
            target: "fatfs",
            "created {:?} as {:?}",
            lookup_entry(tree, id)?.name,
            core::str::from_utf8(&short_alias).unwrap_or("?")
        );
        Ok(())
    }

    /// Release the clusters of a file. With `secure`, their data is zeroed
    /// first; a failure to zero is only logged.
    pub fn delete_file<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        secure: bool,
    ) -> Result<()> {
        self.ensure_mounted()?;
        self.check_media()?;

        let entry = lookup_entry(tree, id)?;
        let data = self.entry_data(tree, id)?;
        let clusters = self.check_file_chain(entry, data.start_cluster)?;
        if data.start_cluster == 0 {
            return Ok(());
        }

        if secure {
            let wiped = self
                .with_fat(|fat| fat.extents(data.start_cluster, 0, clusters))
                .and_then(|extents| table::clear_extents(&self.disk, &self.params, &extents));
            if let Err(err) = wiped {
                log::warn!(target: "fatfs", "could not wipe {:?}: {}", entry.name, err);
            }
        }

        self.release_entry_clusters(tree, id, data.start_cluster)
    }

    fn release_entry_clusters<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        start: u32,
    ) -> Result<()> {
        let freed = self.with_allocator(|map, fat| map.release_chain(fat, start))?;
        self.update_data(tree, id, |d| d.start_cluster = 0)?;

        let entry = lookup_entry_mut(tree, id)?;
        entry.blocks = 0;
        entry.size = 0;
        log::debug!(target: "fatfs", "released {} clusters of {:?}", freed, entry.name);

        self.flush_fat()
    }

    /// Give an entry moved into another directory an alias unique there
    pub fn file_moved<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        if lookup_entry(tree, id)?.is_dot() {
            return Ok(());
        }
        let short_alias = self.unique_alias(tree, id)?;
        self.update_data(tree, id, |d| d.short_alias = short_alias)
    }

    /// Decode a directory from disk and link its entries under `dir`
    pub fn read_dir<T: EntryTree + ?Sized>(&self, tree: &mut T, dir: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        if !lookup_entry(tree, dir)?.is_directory() {
            return Err(FatError::InvalidParameter("not a directory"));
        }
        self.check_media()?;

        let data = self.entry_data(tree, dir)?;
        let raw = if self.is_fixed_root(dir) {
            self.read_fixed_root()?
        } else {
            self.read_chain(data.start_cluster)?
        };
        let records = dir::scan_directory(&raw);

        if dir != self.root {
            self.make_dot_entries(tree, dir)?;
        }
        let mut count = 0;
        for record in records.iter().filter(|r| !r.is_dot()) {
            self.install_record(tree, dir, record)?;
            count += 1;
        }

        log::debug!(
            target: "fatfs",
            "read {} entries from {:?}",
            count,
            lookup_entry(tree, dir)?.name
        );
        Ok(())
    }

    fn read_fixed_root(&self) -> Result<Vec<u8>> {
        let sectors = self.params.root_dir_sectors;
        let mut raw = vec![0u8; sectors as usize * self.params.bytes_per_sector as usize];
        if sectors > 0 {
            self.disk.read(self.params.root_dir_start() as u64, sectors, &mut raw)?;
        }
        Ok(raw)
    }

    /// Create an entry for `record` and link it under `dir`
    fn install_record<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        dir: EntryId,
        record: &DirRecord,
    ) -> Result<()> {
        let id = tree
            .new_entry()
            .ok_or(FatError::ResourceExhausted(Resource::FileEntries))?;

        let installed = self.fill_entry(tree, id, record).and_then(|()| {
            if tree.insert_entry(id, dir) {
                Ok(())
            } else {
                Err(FatError::Structural("could not link directory entry"))
            }
        });
        if let Err(err) = installed {
            if let Err(detach) = self.detach(tree, id) {
                log::warn!(target: "fatfs", "dropping entry data failed: {}", detach);
            }
            tree.release_entry(id);
            return Err(err);
        }
        Ok(())
    }

    fn fill_entry<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        record: &DirRecord,
    ) -> Result<()> {
        // A broken chain is left for the consistency check to find
        let blocks = match self.with_fat(|fat| fat.num_clusters(record.start_cluster)) {
            Ok(blocks) => blocks,
            Err(FatError::Structural(reason)) => {
                log::warn!(target: "fatfs", "{:?}: {}", record.name, reason);
                0
            }
            Err(err) => return Err(err),
        };
        let size = if record.is_directory() {
            blocks as u64 * self.params.cluster_size() as u64
        } else {
            record.size as u64
        };

        let handle = self.attach(tree, id)?;
        *self.pool.lock().get_mut(handle)? = FatEntryData {
            short_alias: record.alias,
            attributes: record.attributes,
            reserved: record.reserved,
            creation_tenths: record.creation_tenths,
            start_cluster: record.start_cluster,
        };

        let entry = lookup_entry_mut(tree, id)?;
        entry.name = record.name.clone();
        entry.file_type = if record.is_directory() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        entry.size = size;
        entry.blocks = blocks;
        entry.created = record.created;
        entry.modified = record.modified;
        entry.accessed = record.accessed;
        Ok(())
    }

    /// Add "." and ".." under `dir`. ".." of a directory in the root points
    /// at cluster 0.
    fn make_dot_entries<T: EntryTree + ?Sized>(&self, tree: &mut T, dir: EntryId) -> Result<()> {
        let data = self.entry_data(tree, dir)?;
        let entry = lookup_entry(tree, dir)?;
        let parent_cluster = match entry.parent {
            Some(parent) if parent != self.root => {
                self.entry_data(tree, parent).map(|d| d.start_cluster).unwrap_or(0)
            }
            _ => 0,
        };

        let dot_record = |name: &str, short_alias: [u8; 11], start_cluster: u32| {
            let mut record = DirRecord::new(name, short_alias, FatAttributes::DIRECTORY);
            record.created = entry.created;
            record.modified = entry.modified;
            record.accessed = entry.accessed;
            record.start_cluster = start_cluster;
            record
        };
        let dot = dot_record(".", DOT_ALIAS, data.start_cluster);
        let dotdot = dot_record("..", DOTDOT_ALIAS, parent_cluster);

        self.install_record(tree, dir, &dot)?;
        self.install_record(tree, dir, &dotdot)
    }

    /// Encode the children of `dir` and write them to disk.
    ///
    /// The fixed FAT12/16 root is written in place; any other directory
    /// chain grows or shrinks to fit.
    pub fn write_dir<T: EntryTree + ?Sized>(&self, tree: &mut T, dir: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        if !lookup_entry(tree, dir)?.is_directory() {
            return Err(FatError::InvalidParameter("not a directory"));
        }
        self.check_media()?;

        let data = self.entry_data(tree, dir)?;
        let records = self.collect_records(tree, dir)?;

        if self.is_fixed_root(dir) {
            let sectors = self.params.root_dir_sectors;
            let len = sectors as usize * self.params.bytes_per_sector as usize;
            let raw = dir::fill_directory(&records, len)?;
            if sectors > 0 {
                self.disk.write(self.params.root_dir_start() as u64, sectors, &raw)?;
            }
            return Ok(());
        }

        let cluster_size = self.params.cluster_size() as usize;
        let clusters = (dir::required_entries(&records) * DIR_ENTRY_SIZE)
            .div_ceil(cluster_size)
            .max(1) as u32;
        let raw = dir::fill_directory(&records, clusters as usize * cluster_size)?;

        let current = self.with_fat(|fat| fat.num_clusters(data.start_cluster))?;
        if clusters < current {
            let shortened =
                self.with_allocator(|map, fat| map.truncate_chain(fat, data.start_cluster, clusters));
            if let Err(err) = shortened {
                log::warn!(target: "fatfs", "could not shorten directory: {}", err);
            }
        }

        let (start, total) = self.grow_chain(data.start_cluster, clusters)?;
        if start != data.start_cluster {
            self.update_data(tree, dir, |d| d.start_cluster = start)?;
        }
        let entry = lookup_entry_mut(tree, dir)?;
        entry.blocks = total;
        entry.size = total as u64 * cluster_size as u64;

        self.write_chain(start, 0, clusters, &raw)
    }

    fn collect_records<T: EntryTree + ?Sized>(&self, tree: &T, dir: EntryId) -> Result<Vec<DirRecord>> {
        let pool = self.pool.lock();
        tree.children(dir)
            .into_iter()
            .map(|child| {
                let entry = lookup_entry(tree, child)?;
                let handle = entry
                    .fs_data
                    .ok_or(FatError::Structural("file entry has no FAT data"))?;
                let data = pool.get(handle)?;

                let mut record = DirRecord::new(&entry.name, data.short_alias, data.attributes);
                record.reserved = data.reserved;
                record.creation_tenths = data.creation_tenths;
                record.created = entry.created;
                record.modified = entry.modified;
                record.accessed = entry.accessed;
                record.start_cluster = data.start_cluster;
                record.size = if entry.is_directory() {
                    0
                } else {
                    u32::try_from(entry.size)
                        .map_err(|_| FatError::InvalidParameter("file larger than 4 GiB"))?
                };
                Ok(record)
            })
            .collect()
    }

    /// Turn a new directory entry into an empty directory: one zeroed
    /// cluster holding "." and "..". The parent directory is written by
    /// the caller.
    pub fn make_dir<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;

        let entry = lookup_entry(tree, id)?;
        if !entry.is_directory() {
            return Err(FatError::InvalidParameter("not a directory"));
        }
        alias::check_filename(&entry.name)?;
        let short_alias = self.unique_alias(tree, id)?;
        self.check_media()?;

        let cluster = self.with_allocator(|map, fat| map.allocate(fat, 1))?;
        let cleared = [Extent { first: cluster, count: 1 }];
        if let Err(err) = table::clear_extents(&self.disk, &self.params, &cleared) {
            if let Err(undo) = self.with_allocator(|map, fat| map.release_chain(fat, cluster)) {
                log::warn!(target: "fatfs", "releasing directory cluster failed: {}", undo);
            }
            return Err(err);
        }

        self.update_data(tree, id, |d| {
            *d = FatEntryData {
                short_alias,
                attributes: FatAttributes::DIRECTORY | FatAttributes::ARCHIVE,
                reserved: 0,
                creation_tenths: 0,
                start_cluster: cluster,
            };
        })?;
        let entry = lookup_entry_mut(tree, id)?;
        entry.blocks = 1;
        entry.size = self.params.cluster_size() as u64;

        self.make_dot_entries(tree, id)?;
        self.write_dir(tree, id)
    }

    /// Release the clusters of a directory the caller has found empty
    pub fn remove_dir<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        if id == self.root {
            return Err(FatError::InvalidParameter("cannot remove the root directory"));
        }

        let entry = lookup_entry(tree, id)?;
        if !entry.is_directory() {
            return Err(FatError::InvalidParameter("not a directory"));
        }
        self.check_media()?;

        let data = self.entry_data(tree, id)?;
        self.check_file_chain(entry, data.start_cluster)?;
        self.release_entry_clusters(tree, id, data.start_cluster)
    }

    /// Mark an entry as modified since the last backup
    pub fn timestamp<T: EntryTree + ?Sized>(&self, tree: &mut T, id: EntryId) -> Result<()> {
        self.ensure_mounted()?;
        self.update_data(tree, id, |d| d.attributes |= FatAttributes::ARCHIVE)
    }

    /// Cut a file down to `new_blocks` clusters and release the rest
    pub fn truncate_file<T: EntryTree + ?Sized>(
        &self,
        tree: &mut T,
        id: EntryId,
        new_blocks: u32,
    ) -> Result<()> {
        self.ensure_mounted()?;

        let entry = lookup_entry(tree, id)?;
        if entry.blocks <= new_blocks {
            return Ok(());
        }
        self.check_media()?;

        let data = self.entry_data(tree, id)?;
        self.check_file_chain(entry, data.start_cluster)?;
        self.with_allocator(|map, fat| map.truncate_chain(fat, data.start_cluster, new_blocks))?;
        if new_blocks == 0 {
            self.update_data(tree, id, |d| d.start_cluster = 0)?;
        }

        let entry = lookup_entry_mut(tree, id)?;
        entry.blocks = new_blocks;
        entry.size = new_blocks as u64 * self.params.cluster_size() as u64;
        self.flush_fat()
    }
}

fn read_fs_info<D: BlockDevice>(disk: &Disk<D>, params: &VolumeParameters, sector: u32) -> Result<FsInfo> {
    let mut buf = vec![0u8; params.bytes_per_sector as usize];
    disk.read(sector as u64, 1, &mut buf)?;
    let info = FsInfo::parse(&buf, params.data_clusters).map_err(|err| {
        log::error!(target: "fatfs", "FSInfo sector {} rejected: {}", sector, err);
        err
    })?;
    if info.has_free_count() {
        log::debug!(target: "fatfs", "FSInfo reports {} free clusters", info.free_cluster_count);
    }
    Ok(info)
}
