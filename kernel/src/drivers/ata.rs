//! ATA PIO disk access (primary channel, LBA28)
//!
//! Polling driver: no IRQs, no DMA. Exposes `read_sectors`/
//! `write_sectors` and a [`BlockDevice`](crate::fs::blockdev::BlockDevice)
//! wrapper the block cache sits on.

use x86_64::instructions::port::Port;

use crate::error::{FsError, KernelError};
use crate::fs::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::sync::IrqMutex;

const IO_BASE: u16 = 0x1F0;
const REG_DATA: u16 = IO_BASE;
const REG_SECTOR_COUNT: u16 = IO_BASE + 2;
const REG_LBA_LOW: u16 = IO_BASE + 3;
const REG_LBA_MID: u16 = IO_BASE + 4;
const REG_LBA_HIGH: u16 = IO_BASE + 5;
const REG_DRIVE: u16 = IO_BASE + 6;
const REG_STATUS: u16 = IO_BASE + 7;
const REG_COMMAND: u16 = IO_BASE + 7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_FLUSH: u8 = 0xE7;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;

const POLL_LIMIT: u32 = 1_000_000;

struct Channel;

impl Channel {
    fn status(&self) -> u8 {
        let mut port: Port<u8> = Port::new(REG_STATUS);
        // SAFETY: status register read, no side effect beyond clearing IRQ.
        unsafe { port.read() }
    }

    fn wait_not_busy(&self) -> Result<(), KernelError> {
        for _ in 0..POLL_LIMIT {
            if self.status() & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(FsError::IoError.into())
    }

    fn wait_data(&self) -> Result<(), KernelError> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & STATUS_ERR != 0 {
                return Err(FsError::IoError.into());
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(FsError::IoError.into())
    }

    fn select(&self, drive: u8, lba: u32, count: u8) -> Result<(), KernelError> {
        self.wait_not_busy()?;
        let mut drive_port: Port<u8> = Port::new(REG_DRIVE);
        let mut count_port: Port<u8> = Port::new(REG_SECTOR_COUNT);
        let mut lba_low: Port<u8> = Port::new(REG_LBA_LOW);
        let mut lba_mid: Port<u8> = Port::new(REG_LBA_MID);
        let mut lba_high: Port<u8> = Port::new(REG_LBA_HIGH);
        // SAFETY: standard LBA28 taskfile programming on the primary
        // channel ports owned by this driver.
        unsafe {
            drive_port.write(0xE0 | (drive & 1) << 4 | ((lba >> 24) & 0x0F) as u8);
            count_port.write(count);
            lba_low.write(lba as u8);
            lba_mid.write((lba >> 8) as u8);
            lba_high.write((lba >> 16) as u8);
        }
        Ok(())
    }

    fn command(&self, cmd: u8) {
        let mut port: Port<u8> = Port::new(REG_COMMAND);
        // SAFETY: command register write after taskfile setup.
        unsafe { port.write(cmd) }
    }

    fn read_sectors(
        &self,
        drive: u8,
        lba: u32,
        count: u8,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }
        self.select(drive, lba, count)?;
        self.command(CMD_READ_SECTORS);
        let mut data: Port<u16> = Port::new(REG_DATA);
        for sector in 0..count as usize {
            self.wait_data()?;
            for word in 0..SECTOR_SIZE / 2 {
                // SAFETY: DRQ is set; one 16-bit transfer per word.
                let value = unsafe { data.read() };
                let off = sector * SECTOR_SIZE + word * 2;
                buf[off] = value as u8;
                buf[off + 1] = (value >> 8) as u8;
            }
        }
        Ok(())
    }

    fn write_sectors(
        &self,
        drive: u8,
        lba: u32,
        count: u8,
        buf: &[u8],
    ) -> Result<(), KernelError> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "buf" });
        }
        self.select(drive, lba, count)?;
        self.command(CMD_WRITE_SECTORS);
        let mut data: Port<u16> = Port::new(REG_DATA);
        for sector in 0..count as usize {
            self.wait_data()?;
            for word in 0..SECTOR_SIZE / 2 {
                let off = sector * SECTOR_SIZE + word * 2;
                let value = buf[off] as u16 | (buf[off + 1] as u16) << 8;
                // SAFETY: DRQ is set; one 16-bit transfer per word.
                unsafe { data.write(value) };
            }
        }
        self.command(CMD_FLUSH);
        self.wait_not_busy()
    }
}

static CHANNEL: IrqMutex<Channel> = IrqMutex::new(Channel);

/// Read `count` sectors starting at `lba` into `buf`.
pub fn read_sectors(drive: u8, lba: u32, count: u8, buf: &mut [u8]) -> Result<(), KernelError> {
    CHANNEL.with(|ch| ch.read_sectors(drive, lba, count, buf))
}

/// Write `count` sectors starting at `lba` from `buf`.
pub fn write_sectors(drive: u8, lba: u32, count: u8, buf: &[u8]) -> Result<(), KernelError> {
    CHANNEL.with(|ch| ch.write_sectors(drive, lba, count, buf))
}

/// One drive on the primary channel, seen as a block device.
pub struct AtaDisk {
    drive: u8,
    sectors: u64,
}

impl AtaDisk {
    pub fn new(drive: u8, sectors: u64) -> Self {
        Self { drive, sectors }
    }
}

impl BlockDevice for AtaDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        let count = (buf.len() / SECTOR_SIZE) as u8;
        read_sectors(self.drive, lba as u32, count, buf)
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError> {
        let count = (buf.len() / SECTOR_SIZE) as u8;
        write_sectors(self.drive, lba as u32, count, buf)
    }
}
