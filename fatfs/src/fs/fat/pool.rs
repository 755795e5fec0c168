//! Per-entry private data
//!
//! Every VFS entry on a FAT volume carries a [`FatEntryData`] holding what
//! the entry tree has no field for: the short alias, the raw attribute byte
//! and the first cluster. The data lives in a per-volume pool with a fixed
//! capacity; the entry only holds an [`EntryHandle`] into it.
//!
//! Slots are never moved. A released slot is zeroed and its generation
//! bumped, so a handle that outlived its entry is caught instead of
//! silently aliasing a newer one.

use alloc::vec::Vec;
use crate::fs::vfs::EntryHandle;
use super::dir::FatAttributes;
use super::error::{FatError, Resource, Result};

/// FAT private data of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatEntryData {
    /// 8.3 alias, space padded
    pub short_alias: [u8; 11],
    pub attributes: FatAttributes,
    /// Reserved byte of the short entry, preserved as found
    pub reserved: u8,
    /// Creation time, tenths of a second
    pub creation_tenths: u8,
    /// First cluster, 0 for an empty file
    pub start_cluster: u32,
}

struct Slot {
    data: FatEntryData,
    generation: u32,
    in_use: bool,
}

/// Capacity-bounded pool of [`FatEntryData`]
pub struct EntryPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    in_use: usize,
}

impl EntryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            in_use: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently attached to entries
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Take a zeroed slot
    pub fn attach(&mut self) -> Result<EntryHandle> {
        if self.in_use >= self.capacity {
            return Err(FatError::ResourceExhausted(Resource::EntryData));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    data: FatEntryData::default(),
                    generation: 0,
                    in_use: false,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        self.in_use += 1;
        Ok(EntryHandle {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: EntryHandle) -> Result<&Slot> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => Ok(slot),
            _ => Err(FatError::Structural("stale entry data handle")),
        }
    }

    pub fn get(&self, handle: EntryHandle) -> Result<&FatEntryData> {
        self.slot(handle).map(|slot| &slot.data)
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Result<&mut FatEntryData> {
        self.slot(handle)?;
        Ok(&mut self.slots[handle.index as usize].data)
    }

    /// Return a slot to the pool
    pub fn release(&mut self, handle: EntryHandle) -> Result<()> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.data = FatEntryData::default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.in_use = false;
        self.free.push(handle.index);
        self.in_use -= 1;
        Ok(())
    }

    /// Drop every slot; all outstanding handles become stale
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.in_use {
                slot.data = FatEntryData::default();
                slot.generation = slot.generation.wrapping_add(1);
                slot.in_use = false;
                self.free.push(index as u32);
            }
        }
        self.in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_release_reuse() {
        let mut pool = EntryPool::new(2);
        let a = pool.attach().unwrap();
        let b = pool.attach().unwrap();
        assert_eq!(pool.attach(), Err(FatError::ResourceExhausted(Resource::EntryData)));

        pool.get_mut(a).unwrap().start_cluster = 42;
        assert_eq!(pool.get(a).unwrap().start_cluster, 42);
        assert_eq!(pool.get(b).unwrap().start_cluster, 0);

        pool.release(a).unwrap();
        assert_eq!(pool.in_use(), 1);
        let c = pool.attach().unwrap();
        assert_eq!(c.index, a.index);
        assert_eq!(pool.get(c).unwrap(), &FatEntryData::default());
    }

    #[test]
    fn test_stale_handles() {
        let mut pool = EntryPool::new(4);
        let a = pool.attach().unwrap();
        pool.release(a).unwrap();
        assert!(matches!(pool.get(a), Err(FatError::Structural(_))));
        assert!(pool.release(a).is_err());

        let b = pool.attach().unwrap();
        pool.clear();
        assert!(pool.get(b).is_err());
        assert_eq!(pool.in_use(), 0);
    }
}
