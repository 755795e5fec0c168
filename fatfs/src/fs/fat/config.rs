//! FAT driver configuration

use super::error::{FatError, Result};

/// Default number of FAT sectors kept in memory per volume
pub const DEFAULT_FAT_CACHE_SECTORS: usize = 300;

/// Default capacity of the private entry-data pool per volume
pub const DEFAULT_MAX_ENTRY_DATA: usize = 1024;

/// Per-mount tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatConfig {
    /// FAT sectors the LRU cache may hold
    pub fat_cache_sectors: usize,
    /// Entries that may carry FAT private data at once
    pub max_entry_data: usize,
}

impl FatConfig {
    pub const fn new() -> Self {
        Self {
            fat_cache_sectors: DEFAULT_FAT_CACHE_SECTORS,
            max_entry_data: DEFAULT_MAX_ENTRY_DATA,
        }
    }

    pub const fn with_fat_cache_sectors(mut self, sectors: usize) -> Self {
        self.fat_cache_sectors = sectors;
        self
    }

    pub const fn with_max_entry_data(mut self, entries: usize) -> Self {
        self.max_entry_data = entries;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fat_cache_sectors == 0 {
            return Err(FatError::InvalidParameter("FAT cache needs at least one sector"));
        }
        if self.max_entry_data == 0 {
            return Err(FatError::InvalidParameter("entry data pool needs at least one slot"));
        }
        Ok(())
    }
}

impl Default for FatConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let config = FatConfig::default();
        assert_eq!(config, FatConfig { fat_cache_sectors: 300, max_entry_data: 1024 });
        assert!(config.validate().is_ok());
        assert!(config.with_fat_cache_sectors(0).validate().is_err());
        assert!(config.with_max_entry_data(0).validate().is_err());
    }
}
