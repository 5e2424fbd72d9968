//! Block device abstraction
//!
//! The seam between the filesystem stack and the ATA PIO driver. A RAM
//! disk implementation doubles as the test device and a boot-time
//! scratch volume; its storage handle can be cloned so a test can tear
//! a cache down and re-mount the same bytes.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{FsError, KernelError};

/// Sector size every device in this kernel uses.
pub const SECTOR_SIZE: usize = 512;

/// Sector-addressed device.
pub trait BlockDevice: Send + Sync {
    /// Total sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `lba`; `buf.len()` must be a
    /// sector multiple.
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError>;

    /// Write whole sectors starting at `lba`.
    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError>;
}

/// RAM-backed block device.
pub struct RamDisk {
    storage: Arc<Mutex<Vec<u8>>>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            storage: Arc::new(Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE])),
        }
    }

    /// Second handle onto the same bytes.
    pub fn clone_handle(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }

    fn span(&self, lba: u64, len: usize) -> Result<(usize, usize), KernelError> {
        if len % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.storage.lock().len() {
            return Err(FsError::IoError.into());
        }
        Ok((start, end))
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        (self.storage.lock().len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        let (start, end) = self.span(lba, buf.len())?;
        buf.copy_from_slice(&self.storage.lock()[start..end]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError> {
        let (start, end) = self.span(lba, buf.len())?;
        self.storage.lock()[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let disk = RamDisk::new(16);
        assert_eq!(disk.sector_count(), 16);

        let data = [0x42u8; SECTOR_SIZE];
        disk.write_sectors(3, &data).unwrap();

        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, data);

        // Shared handle sees the same bytes.
        let twin = disk.clone_handle();
        twin.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let disk = RamDisk::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_sectors(2, &mut buf).is_err());
        assert!(disk.write_sectors(5, &buf).is_err());
    }
}
