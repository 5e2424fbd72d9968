//! Block cache
//!
//! Write-back LRU cache of fixed-size blocks over a sector device. The
//! block size is a multiple of the sector size; recency is a monotone
//! timestamp bumped on every access. Eviction prefers invalid slots,
//! then the smallest `last_used`, writing dirty victims back first. No
//! read-ahead.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::error::KernelError;

struct CacheEntry {
    block_num: u64,
    last_used: u64,
    valid: bool,
    dirty: bool,
    data: Vec<u8>,
}

/// Hit/miss counters, surfaced through diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
}

pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    entries: Vec<CacheEntry>,
    timestamp: u64,
    stats: CacheStats,
}

impl BlockCache {
    /// `block_size` must be a non-zero multiple of the sector size.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
        num_entries: usize,
    ) -> Result<Self, KernelError> {
        if block_size == 0 || block_size % SECTOR_SIZE != 0 || num_entries == 0 {
            return Err(KernelError::InvalidArgument { name: "block_size" });
        }
        let entries = (0..num_entries)
            .map(|_| CacheEntry {
                block_num: 0,
                last_used: 0,
                valid: false,
                dirty: false,
                data: vec![0u8; block_size],
            })
            .collect();
        Ok(Self {
            device,
            block_size,
            entries,
            timestamp: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn touch(&mut self, slot: usize) {
        self.timestamp += 1;
        self.entries[slot].last_used = self.timestamp;
    }

    fn lookup(&self, block: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.valid && e.block_num == block)
    }

    /// Pick the victim slot: any invalid entry, else least recently used.
    fn victim(&self) -> usize {
        self.entries
            .iter()
            .position(|e| !e.valid)
            .unwrap_or_else(|| {
                self.entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
    }

    fn sectors_per_block(&self) -> u64 {
        (self.block_size / SECTOR_SIZE) as u64
    }

    fn writeback(&mut self, slot: usize) -> Result<(), KernelError> {
        if self.entries[slot].valid && self.entries[slot].dirty {
            let lba = self.entries[slot].block_num * self.sectors_per_block();
            self.device.write_sectors(lba, &self.entries[slot].data)?;
            self.entries[slot].dirty = false;
            self.stats.writebacks += 1;
        }
        Ok(())
    }

    /// Evict the victim and load `block` into its slot.
    fn fill(&mut self, block: u64) -> Result<usize, KernelError> {
        let slot = self.victim();
        self.writeback(slot)?;
        let lba = block * self.sectors_per_block();
        self.entries[slot].valid = false;
        let mut data = core::mem::take(&mut self.entries[slot].data);
        self.device.read_sectors(lba, &mut data)?;
        self.entries[slot].data = data;
        self.entries[slot].block_num = block;
        self.entries[slot].valid = true;
        self.entries[slot].dirty = false;
        Ok(slot)
    }

    /// Read one block into `buf`.
    pub fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() != self.block_size {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }
        let slot = match self.lookup(block) {
            Some(slot) => {
                self.stats.hits += 1;
                slot
            }
            None => {
                self.stats.misses += 1;
                self.fill(block)?
            }
        };
        self.touch(slot);
        buf.copy_from_slice(&self.entries[slot].data);
        Ok(())
    }

    /// Overwrite one block; the payload reaches the device at eviction or
    /// [`flush`](Self::flush).
    pub fn write(&mut self, block: u64, buf: &[u8]) -> Result<(), KernelError> {
        if buf.len() != self.block_size {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }
        let slot = match self.lookup(block) {
            Some(slot) => {
                self.stats.hits += 1;
                slot
            }
            None => {
                self.stats.misses += 1;
                // Whole-block overwrite: no need to read the old contents.
                let slot = self.victim();
                self.writeback(slot)?;
                self.entries[slot].block_num = block;
                self.entries[slot].valid = true;
                slot
            }
        };
        self.entries[slot].data.copy_from_slice(buf);
        self.entries[slot].dirty = true;
        self.touch(slot);
        Ok(())
    }

    /// Write every dirty block back and clear the dirty bits.
    pub fn flush(&mut self) -> Result<(), KernelError> {
        let mut first_err = None;
        for slot in 0..self.entries.len() {
            if let Err(e) = self.writeback(slot) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and drop the cache contents; the device handle survives in
    /// its `Arc`.
    pub fn destroy(mut self) -> Result<(), KernelError> {
        self.flush()?;
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if self.flush().is_err() {
            log::error!("cache: flush on drop failed, dirty blocks lost");
        }
    }
}

/// Convenience for mount paths: read a block allocating the buffer.
pub fn read_block(cache: &mut BlockCache, block: u64) -> Result<Vec<u8>, KernelError> {
    let mut buf = vec![0u8; cache.block_size()];
    cache.read(block, &mut buf)?;
    Ok(buf)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn setup(entries: usize) -> (Arc<RamDisk>, BlockCache) {
        let disk = Arc::new(RamDisk::new(64));
        let cache = BlockCache::new(
            Arc::clone(&disk) as Arc<dyn BlockDevice>,
            SECTOR_SIZE,
            entries,
        )
        .unwrap();
        (disk, cache)
    }

    #[test]
    fn write_then_read_hits_cache() {
        let (_disk, mut cache) = setup(4);
        let data = [7u8; SECTOR_SIZE];
        cache.write(5, &data).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(5, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn dirty_block_survives_flush_and_reinit() {
        let (disk, cache) = setup(4);
        let mut cache = cache;
        let data = [0xA5u8; SECTOR_SIZE];
        cache.write(9, &data).unwrap();
        cache.flush().unwrap();
        cache.destroy().unwrap();

        let mut fresh = BlockCache::new(
            Arc::clone(&disk) as Arc<dyn BlockDevice>,
            SECTOR_SIZE,
            4,
        )
        .unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        fresh.read(9, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(fresh.stats().misses, 1);
    }

    #[test]
    fn eviction_writes_back_lru_victim() {
        let (disk, mut cache) = setup(2);
        let a = [1u8; SECTOR_SIZE];
        let b = [2u8; SECTOR_SIZE];
        let c = [3u8; SECTOR_SIZE];
        cache.write(0, &a).unwrap();
        cache.write(1, &b).unwrap();
        // Touch block 0 so block 1 is the LRU victim.
        let mut scratch = [0u8; SECTOR_SIZE];
        cache.read(0, &mut scratch).unwrap();
        cache.write(2, &c).unwrap();

        // Block 1 must have been written through on eviction.
        let mut direct = [0u8; SECTOR_SIZE];
        disk.read_sectors(1, &mut direct).unwrap();
        assert_eq!(direct, b);
        assert_eq!(cache.stats().writebacks, 1);

        // Block 0 is still cached.
        let hits_before = cache.stats().hits;
        cache.read(0, &mut scratch).unwrap();
        assert_eq!(cache.stats().hits, hits_before + 1);
        assert_eq!(scratch, a);
    }

    #[test]
    fn multi_sector_blocks() {
        let disk = Arc::new(RamDisk::new(64));
        let mut cache = BlockCache::new(
            Arc::clone(&disk) as Arc<dyn BlockDevice>,
            4 * SECTOR_SIZE,
            2,
        )
        .unwrap();
        let data = [0x5Au8; 4 * SECTOR_SIZE];
        cache.write(3, &data).unwrap();
        cache.flush().unwrap();
        // Block 3 of a 4-sector cache starts at LBA 12.
        let mut direct = [0u8; SECTOR_SIZE];
        disk.read_sectors(12, &mut direct).unwrap();
        assert_eq!(direct, [0x5A; SECTOR_SIZE]);
    }

    #[test]
    fn rejects_bad_geometry() {
        let disk = Arc::new(RamDisk::new(8));
        assert!(BlockCache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>, 100, 4).is_err());
        assert!(BlockCache::new(disk as Arc<dyn BlockDevice>, SECTOR_SIZE, 0).is_err());
    }
}
