//! Free cluster bitmap and cluster allocator
//!
//! One bit per FAT entry, most significant bit first within each byte. A set
//! bit is a cluster in use. Entries 0 and 1 and the padding bits past the
//! last cluster are permanently set, so a scan never has to bounds-check.
//!
//! The map is built once per mount by scanning the whole FAT. The owning
//! volume keeps it behind the free-map lock; every change to the map here is
//! made together with the matching FAT writes, so the two never disagree
//! outside that lock.

use alloc::vec;
use alloc::vec::Vec;
use crate::io::block::BlockDevice;
use super::bpb::cluster_values;
use super::error::{FatError, Resource, Result};
use super::table::FatTable;

/// A run of clusters claimed by one allocation, and how many of its FAT
/// entries have been written so far
#[derive(Debug, Clone, Copy)]
struct Claim {
    first: u32,
    count: u32,
    linked: u32,
}

/// Free cluster map of one volume
pub struct FreeMap {
    bits: Vec<u8>,
    /// Number of bits in use, one per FAT entry
    size: u32,
    free_clusters: u32,
    /// Re-entrancy guard for `build`
    building: bool,
    ready: bool,
}

impl FreeMap {
    pub const fn new() -> Self {
        Self {
            bits: Vec::new(),
            size: 0,
            free_clusters: 0,
            building: false,
            ready: false,
        }
    }

    /// The map reflects the FAT and may be allocated from
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_clusters
    }

    /// Forget the map. The next allocation rebuilds it.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn test_bit(&self, bit: u32) -> bool {
        if bit >= self.size {
            return true;
        }
        self.bits[(bit / 8) as usize] & (0x80 >> (bit % 8)) != 0
    }

    #[inline]
    pub fn set_bit(&mut self, bit: u32) {
        if bit < self.size {
            self.bits[(bit / 8) as usize] |= 0x80 >> (bit % 8);
        }
    }

    #[inline]
    pub fn clear_bit(&mut self, bit: u32) {
        if bit < self.size {
            self.bits[(bit / 8) as usize] &= !(0x80 >> (bit % 8));
        }
    }

    pub fn set_bits(&mut self, start: u32, count: u32) {
        for bit in start..start.saturating_add(count) {
            self.set_bit(bit);
        }
    }

    /// Count of clear bits, computed from the bitmap itself
    pub fn number_of_clear_bits(&self) -> u32 {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        (self.bits.len() as u32 * 8) - set
    }

    /// Scan the FAT and rebuild the map.
    ///
    /// Does nothing if the map is already built or a build is in progress.
    pub fn build<D: BlockDevice>(&mut self, fat: &mut FatTable<'_, D>) -> Result<()> {
        if self.ready || self.building {
            return Ok(());
        }
        self.building = true;

        let max = fat.params().max_cluster();
        let size = max + 1;
        self.bits = vec![0u8; size.div_ceil(8) as usize];
        self.size = size;

        let padding = self.bits.len() as u32 * 8;
        for bit in size..padding {
            self.bits[(bit / 8) as usize] |= 0x80 >> (bit % 8);
        }
        self.set_bit(0);
        self.set_bit(1);

        let mut free = 0;
        for cluster in cluster_values::FIRST_DATA..=max {
            match fat.get_entry(cluster) {
                Ok(cluster_values::FREE) => free += 1,
                Ok(_) => self.set_bit(cluster),
                Err(err) => {
                    log::error!(target: "fatfs", "free map build failed at cluster {}: {}", cluster, err);
                    self.bits = Vec::new();
                    self.size = 0;
                    self.building = false;
                    return Err(err);
                }
            }
        }

        self.free_clusters = free;
        self.building = false;
        self.ready = true;
        log::info!(
            target: "fatfs",
            "free map built: {} of {} clusters free",
            free,
            fat.params().data_clusters
        );
        Ok(())
    }

    /// First-fit search for `want` clear bits.
    ///
    /// Returns the first run of exactly `want` clusters, or failing that the
    /// longest run seen. `None` when nothing is free.
    pub fn find_run(&self, want: u32) -> Option<(u32, u32)> {
        self.find_run_from(cluster_values::FIRST_DATA, want, u32::MAX)
    }

    /// [`FreeMap::find_run`] starting at `from` and wrapping around to the
    /// first data cluster. No run is longer than `longest`, so finding one
    /// that long ends the scan early.
    fn find_run_from(&self, from: u32, want: u32, longest: u32) -> Option<(u32, u32)> {
        let target = want.min(longest);
        let mut best = (0u32, 0u32);

        for (lo, hi) in [(from, self.size), (cluster_values::FIRST_DATA, from)] {
            let mut run_start = 0u32;
            let mut run_len = 0u32;

            let mut bit = lo;
            while bit < hi {
                if bit % 8 == 0 && self.bits[(bit / 8) as usize] == 0xFF {
                    run_len = 0;
                    bit += 8;
                    continue;
                }

                if self.test_bit(bit) {
                    run_len = 0;
                } else {
                    if run_len == 0 {
                        run_start = bit;
                    }
                    run_len += 1;
                    if run_len > best.1 {
                        best = (run_start, run_len);
                    }
                    if run_len == target {
                        return Some((run_start, target));
                    }
                }
                bit += 1;
            }
        }

        if best.1 == 0 {
            None
        } else {
            Some(best)
        }
    }

    /// Lowest free cluster, for the FSInfo hint
    pub fn first_free(&self) -> Option<u32> {
        self.find_run(1).map(|(start, _)| start)
    }

    /// Allocate `count` clusters as one chain and return its first cluster.
    ///
    /// A single contiguous run is preferred. When none is long enough, the
    /// longest run is taken and the rest allocated the same way, the pieces
    /// spliced into one chain. On failure every cluster claimed by this call
    /// is released again.
    pub fn allocate<D: BlockDevice>(&mut self, fat: &mut FatTable<'_, D>, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        if !self.ready {
            return Err(FatError::Structural("free map used before it was built"));
        }
        if count > self.free_clusters {
            return Err(FatError::ResourceExhausted(Resource::Clusters));
        }

        let mut claims = Vec::new();
        match self.claim_runs(fat, count, &mut claims) {
            Ok(()) => {
                let first = claims[0].first;
                log::debug!(
                    target: "fatfs",
                    "allocated {} clusters at {} in {} run(s)",
                    count,
                    first,
                    claims.len()
                );
                Ok(first)
            }
            Err(err) => {
                log::warn!(target: "fatfs", "allocation of {} clusters failed: {}", count, err);
                for claim in claims {
                    self.unclaim(fat, claim);
                }
                Err(err)
            }
        }
    }

    fn claim_runs<D: BlockDevice>(
        &mut self,
        fat: &mut FatTable<'_, D>,
        count: u32,
        claims: &mut Vec<Claim>,
    ) -> Result<()> {
        let mut remaining = count;
        let mut from = cluster_values::FIRST_DATA;
        let mut longest = u32::MAX;

        while remaining > 0 {
            let (first, len) = self
                .find_run_from(from, remaining, longest)
                .ok_or(FatError::ResourceExhausted(Resource::Clusters))?;
            if len < remaining {
                // Nothing left in the map is longer than this run
                longest = len;
            }

            for cluster in first..first + len {
                self.set_bit(cluster);
            }
            self.free_clusters -= len;
            claims.push(Claim { first, count: len, linked: 0 });
            let index = claims.len() - 1;

            let last = first + len - 1;
            for cluster in first..last {
                fat.set_entry(cluster, cluster + 1)?;
                claims[index].linked += 1;
            }
            fat.set_entry(last, fat.params().terminal_cluster)?;
            claims[index].linked += 1;

            if index > 0 {
                let previous = claims[index - 1];
                fat.set_entry(previous.first + previous.count - 1, first)?;
            }

            remaining -= len;
            from = first + len;
        }
        Ok(())
    }

    /// Undo a claim. Entries that were written are zeroed first; a cluster
    /// whose entry cannot be zeroed stays marked in use.
    fn unclaim<D: BlockDevice>(&mut self, fat: &mut FatTable<'_, D>, claim: Claim) {
        for i in 0..claim.count {
            let cluster = claim.first + i;
            if i < claim.linked && fat.set_entry(cluster, cluster_values::FREE).is_err() {
                continue;
            }
            self.clear_bit(cluster);
            self.free_clusters += 1;
        }
    }

    /// Free every cluster of a chain.
    ///
    /// Keeps going past entries that cannot be written and returns the first
    /// failure. Returns the number of clusters freed.
    pub fn release_chain<D: BlockDevice>(&mut self, fat: &mut FatTable<'_, D>, start: u32) -> Result<u32> {
        if start == 0 {
            return Ok(0);
        }

        let clusters = fat.chain(start)?;
        let mut freed = 0;
        let mut first_error = None;

        for cluster in clusters {
            match fat.set_entry(cluster, cluster_values::FREE) {
                Ok(()) => {
                    if self.ready && self.test_bit(cluster) {
                        self.clear_bit(cluster);
                        self.free_clusters += 1;
                    }
                    freed += 1;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(freed),
        }
    }

    /// Cut a chain down to its first `keep` clusters and free the rest.
    ///
    /// `keep == 0` frees the whole chain; the caller then clears the start
    /// cluster it holds. Returns the number of clusters freed.
    pub fn truncate_chain<D: BlockDevice>(
        &mut self,
        fat: &mut FatTable<'_, D>,
        start: u32,
        keep: u32,
    ) -> Result<u32> {
        if keep == 0 {
            return self.release_chain(fat, start);
        }

        let last_kept = fat.nth_cluster(start, keep - 1)?;
        let rest = fat.next_cluster(last_kept)?;
        match rest {
            Some(next) => {
                fat.set_entry(last_kept, fat.params().terminal_cluster)?;
                self.release_chain(fat, next)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::cache::FatCache;
    use crate::fs::fat::table::tests::{fat12, fat16, fat32};

    #[test]
    fn test_build_counts_used_entries() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 16);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        fat.set_entry(2, 3).unwrap();
        fat.set_entry(3, 0xFFF).unwrap();
        fat.set_entry(100, 0xFF7).unwrap();

        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();
        assert!(map.is_ready());
        assert_eq!(map.free_clusters(), params.data_clusters - 3);
        assert_eq!(map.number_of_clear_bits(), map.free_clusters());
        assert!(map.test_bit(0) && map.test_bit(1) && map.test_bit(100));
        assert!(!map.test_bit(4));

        // A second build is a no-op
        fat.set_entry(5, 6).unwrap();
        map.build(&mut fat).unwrap();
        assert_eq!(map.free_clusters(), params.data_clusters - 3);
    }

    #[test]
    fn test_contiguous_allocation() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 16);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        assert_eq!(map.allocate(&mut fat, 0).unwrap(), 0);
        let start = map.allocate(&mut fat, 5).unwrap();
        assert_eq!(start, 2);
        assert_eq!(fat.chain(start).unwrap(), [2, 3, 4, 5, 6]);
        assert_eq!(map.first_free(), Some(7));

        let over = params.data_clusters;
        assert_eq!(
            map.allocate(&mut fat, over),
            Err(FatError::ResourceExhausted(Resource::Clusters))
        );
        assert_eq!(map.free_clusters(), params.data_clusters - 5);
    }

    #[test]
    fn test_fragmented_fallback() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 16);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        let a = map.allocate(&mut fat, 5).unwrap();
        let _b = map.allocate(&mut fat, 5).unwrap();
        let c = map.allocate(&mut fat, 5).unwrap();
        let rest = map.free_clusters();
        let _d = map.allocate(&mut fat, rest).unwrap();
        assert_eq!(map.free_clusters(), 0);

        map.release_chain(&mut fat, a).unwrap();
        map.release_chain(&mut fat, c).unwrap();
        assert_eq!(map.free_clusters(), 10);

        // No run of 8 exists, but 10 clusters are free
        let start = map.allocate(&mut fat, 8).unwrap();
        let chain = fat.chain(start).unwrap();
        assert_eq!(chain, [2, 3, 4, 5, 6, 12, 13, 14]);
        assert_eq!(fat.get_entry(14).unwrap(), params.terminal_cluster);
        assert_eq!(map.free_clusters(), 2);
        assert_eq!(map.number_of_clear_bits(), 2);
    }

    #[test]
    fn test_conservation_over_mixed_operations() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 16);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        let mut chains: Vec<(u32, u32)> = Vec::new();
        let mut seed = 12345u32;
        for step in 0..200 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            if step % 3 == 2 && !chains.is_empty() {
                let (start, len) = chains.remove((seed as usize) % chains.len());
                assert_eq!(map.release_chain(&mut fat, start).unwrap(), len);
            } else {
                let count = 1 + (seed >> 16) % 40;
                if let Ok(start) = map.allocate(&mut fat, count) {
                    chains.push((start, count));
                }
            }

            let allocated: u32 = chains.iter().map(|&(_, len)| len).sum();
            assert_eq!(map.free_clusters() + allocated, params.data_clusters);
            assert_eq!(map.number_of_clear_bits(), map.free_clusters());
        }
        for (start, len) in chains {
            assert_eq!(fat.num_clusters(start).unwrap(), len);
        }
    }

    #[test]
    fn test_failed_allocation_releases_partial_runs() {
        let (disk, params) = fat16();
        let mut cache = FatCache::new(&params, 1);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        // Leave two holes: 10..=13 and 600..=700
        map.set_bits(2, params.data_clusters);
        for cluster in (10..=13).chain(600..=700) {
            map.clear_bit(cluster);
        }
        map.free_clusters = map.number_of_clear_bits();
        assert_eq!(map.free_clusters, 105);

        // The second run needs FAT sector 0, evicting dirty sector 2
        disk.device().fail_writes_at(Some(1 + 2));
        assert!(matches!(map.allocate(&mut fat, 103), Err(FatError::Io(_))));
        assert_eq!(map.free_clusters(), 105);
        assert_eq!(map.number_of_clear_bits(), 105);
        assert_eq!(fat.get_entry(600).unwrap(), 0);
        assert_eq!(fat.get_entry(700).unwrap(), 0);

        disk.device().fail_writes_at(None);
        let start = map.allocate(&mut fat, 103).unwrap();
        assert_eq!(start, 600);
        assert_eq!(fat.num_clusters(start).unwrap(), 103);
        assert_eq!(fat.last_cluster(start).unwrap(), 11);
    }

    #[test]
    fn test_allocation_across_many_fragments() {
        let (disk, params) = fat32();
        let mut cache = FatCache::new(&params, 16);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        // Every even cluster in use leaves only single-cluster runs
        for cluster in (2..=params.max_cluster()).step_by(2) {
            map.set_bit(cluster);
        }
        map.free_clusters = map.number_of_clear_bits();
        let free = map.free_clusters();
        assert!(free > 30000);

        let start = map.allocate(&mut fat, free - 100).unwrap();
        assert_eq!(start, 3);
        let chain = fat.chain(start).unwrap();
        assert_eq!(chain.len() as u32, free - 100);
        assert_eq!(&chain[..4], [3, 5, 7, 9]);
        assert_eq!(map.free_clusters(), 100);
        assert_eq!(map.number_of_clear_bits(), 100);
        assert_eq!(map.first_free(), Some(chain[chain.len() - 1] + 2));
    }

    #[test]
    fn test_failed_straddling_entry_is_not_left_half_written() {
        let (disk, params) = fat12();
        let mut cache = FatCache::new(&params, 1);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        // Entry 341 occupies bytes 511 and 512 of the FAT
        map.set_bits(2, 339);
        map.free_clusters = map.number_of_clear_bits();
        let free = map.free_clusters();
        assert_eq!(map.first_free(), Some(341));

        // Writing the second byte evicts the dirty first FAT sector
        disk.device().fail_writes_at(Some(1));
        assert!(matches!(map.allocate(&mut fat, 2), Err(FatError::Io(_))));
        assert_eq!(map.free_clusters(), free);
        assert!(!map.test_bit(341));

        disk.device().fail_writes_at(None);
        assert_eq!(fat.get_entry(341).unwrap(), 0);
        assert_eq!(fat.get_entry(342).unwrap(), 0);
        assert_eq!(fat.get_entry(340).unwrap(), 0);
    }

    #[test]
    fn test_truncate_chain() {
        let (disk, params) = fat16();
        let mut cache = FatCache::new(&params, 4);
        let mut fat = FatTable::new(&params, &disk, &mut cache);
        let mut map = FreeMap::new();
        map.build(&mut fat).unwrap();

        let start = map.allocate(&mut fat, 6).unwrap();
        assert_eq!(map.truncate_chain(&mut fat, start, 2).unwrap(), 4);
        assert_eq!(fat.num_clusters(start).unwrap(), 2);
        assert_eq!(map.truncate_chain(&mut fat, start, 2).unwrap(), 0);
        assert_eq!(map.free_clusters(), params.data_clusters - 2);

        assert_eq!(map.truncate_chain(&mut fat, start, 0).unwrap(), 2);
        assert_eq!(map.free_clusters(), params.data_clusters);
    }
}
