use alloc::sync::Arc;
use log::error;

use crate::config::PartitionConfig;
use crate::error::{FsError, FsResult};

/// Physical NOR flash chip.
///
/// Erased bytes read back as `0xFF`, programming can only clear bits and
/// erasing works on whole sectors.
pub trait NorFlash: Send + Sync {
    fn sector_size(&self) -> u32;
    fn sector_count(&self) -> u32;
    fn read(&self, address: u32, buf: &mut [u8]) -> FsResult<()>;
    fn write(&self, address: u32, data: &[u8]) -> FsResult<()>;
    /// Erase the sector containing `address`
    fn sector_erase(&self, address: u32) -> FsResult<()>;

    fn sector_erase_range(&self, first_sector: u32, count: u32) -> FsResult<()> {
        let end = first_sector.checked_add(count).ok_or(FsError::OutOfBounds)?;
        if end > self.sector_count() {
            return Err(FsError::OutOfBounds);
        }
        for sector in first_sector..end {
            self.sector_erase(sector * self.sector_size())?;
        }
        Ok(())
    }

    fn chip_erase(&self) -> FsResult<()> {
        self.sector_erase_range(0, self.sector_count())
    }
}

impl<T: NorFlash + ?Sized> NorFlash for Arc<T> {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }
    fn read(&self, address: u32, buf: &mut [u8]) -> FsResult<()> {
        (**self).read(address, buf)
    }
    fn write(&self, address: u32, data: &[u8]) -> FsResult<()> {
        (**self).write(address, data)
    }
    fn sector_erase(&self, address: u32) -> FsResult<()> {
        (**self).sector_erase(address)
    }
    fn sector_erase_range(&self, first_sector: u32, count: u32) -> FsResult<()> {
        (**self).sector_erase_range(first_sector, count)
    }
    fn chip_erase(&self) -> FsResult<()> {
        (**self).chip_erase()
    }
}

/// Sector range of a flash device as seen by the filesystem.
///
/// All addresses are relative to the start of the partition.
pub trait FlashPartition: Send {
    fn read(&self, address: u32, buf: &mut [u8]) -> FsResult<()>;
    fn write(&self, address: u32, data: &[u8]) -> FsResult<()>;
    fn sector_erase(&self, address: u32) -> FsResult<()>;
    fn sector_erase_range(&self, first_sector: u32, count: u32) -> FsResult<()>;
    fn full_erase(&self) -> FsResult<()>;
    fn sector_size(&self) -> u32;
    fn sector_count(&self) -> u32;
    fn size(&self) -> u32;
}

/// Contiguous run of sectors carved out of a [`NorFlash`] chip
pub struct NorFlashPartition<F: NorFlash> {
    flash: F,
    first_sector: u32,
    sector_count: u32,
    start_address: u32,
    size: u32,
}

impl<F: NorFlash> NorFlashPartition<F> {
    pub fn new(flash: F, first_sector: u32, sector_count: u32) -> FsResult<Self> {
        let end = first_sector
            .checked_add(sector_count)
            .ok_or(FsError::InvalidConfig)?;
        if sector_count == 0 || end > flash.sector_count() {
            return Err(FsError::InvalidConfig);
        }
        let sector_size = flash.sector_size();
        let size = sector_size
            .checked_mul(sector_count)
            .ok_or(FsError::InvalidConfig)?;
        Ok(Self {
            start_address: sector_size * first_sector,
            flash,
            first_sector,
            sector_count,
            size,
        })
    }

    pub fn from_config(flash: F, config: &PartitionConfig) -> FsResult<Self> {
        Self::new(flash, config.first_sector, config.sector_count)
    }

    /// Device backing the partition
    pub fn flash(&self) -> &F {
        &self.flash
    }

    fn check_range(&self, address: u32, len: usize) -> FsResult<u32> {
        let len = u32::try_from(len).map_err(|_| FsError::OutOfBounds)?;
        match address.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.start_address + address),
            _ => Err(FsError::OutOfBounds),
        }
    }
}

impl<F: NorFlash> FlashPartition for NorFlashPartition<F> {
    fn read(&self, address: u32, buf: &mut [u8]) -> FsResult<()> {
        let len = buf.len();
        let physical = self.check_range(address, len)?;
        self.flash.read(physical, buf).map_err(|e| {
            error!("flash read of {} bytes at {:#x} failed", len, physical);
            e
        })
    }

    fn write(&self, address: u32, data: &[u8]) -> FsResult<()> {
        let physical = self.check_range(address, data.len())?;
        self.flash.write(physical, data).map_err(|e| {
            error!("flash write of {} bytes at {:#x} failed", data.len(), physical);
            e
        })
    }

    fn sector_erase(&self, address: u32) -> FsResult<()> {
        if address >= self.size {
            return Err(FsError::OutOfBounds);
        }
        let physical = self.start_address + address;
        self.flash.sector_erase(physical).map_err(|e| {
            error!("flash erase of sector at {:#x} failed", physical);
            e
        })
    }

    fn sector_erase_range(&self, first_sector: u32, count: u32) -> FsResult<()> {
        match first_sector.checked_add(count) {
            Some(end) if end <= self.sector_count => {}
            _ => return Err(FsError::OutOfBounds),
        }
        self.flash
            .sector_erase_range(self.first_sector + first_sector, count)
            .map_err(|e| {
                error!("flash erase of {} sectors from {} failed", count, first_sector);
                e
            })
    }

    fn full_erase(&self) -> FsResult<()> {
        self.sector_erase_range(0, self.sector_count)
    }

    fn sector_size(&self) -> u32 {
        self.flash.sector_size()
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn size(&self) -> u32 {
        self.size
    }
}
