//! RAM backed NOR flash used for host simulation and crash testing.

use alloc::{vec, vec::Vec};
use spin::Mutex;

use crate::error::{FsError, FsResult};
use crate::flash::NorFlash;

struct Cells {
    data: Vec<u8>,
    /// Bytes that may still be programmed before the simulated power cut
    budget: Option<usize>,
}

impl Cells {
    /// Consume budget for `len` bytes, returns how many may be programmed
    fn take(&mut self, len: usize) -> usize {
        match self.budget.as_mut() {
            None => len,
            Some(left) => {
                let granted = len.min(*left);
                *left -= granted;
                granted
            }
        }
    }

    fn powered_off(&self) -> bool {
        self.budget == Some(0)
    }
}

/// NOR flash chip simulated in memory.
///
/// Writes behave like real NOR programming (`old & new`), erases reset a whole
/// sector to `0xFF`. A power cut can be armed to stop programming after a given
/// number of bytes; every operation after the cut fails with [`FsError::Io`].
pub struct RamNorFlash {
    sector_size: u32,
    sector_count: u32,
    cells: Mutex<Cells>,
}

impl RamNorFlash {
    /// Create a fully erased chip
    pub fn new(sector_size: u32, sector_count: u32) -> Self {
        let size = sector_size as usize * sector_count as usize;
        Self {
            sector_size,
            sector_count,
            cells: Mutex::new(Cells {
                data: vec![0xFF; size],
                budget: None,
            }),
        }
    }

    /// Allow only `bytes` more bytes to be programmed, then fail everything
    pub fn cut_power_after(&self, bytes: usize) {
        self.cells.lock().budget = Some(bytes);
    }

    pub fn restore_power(&self) {
        self.cells.lock().budget = None;
    }

    /// Copy of the whole chip content
    pub fn image(&self) -> Vec<u8> {
        self.cells.lock().data.clone()
    }

    /// Overwrite raw content, bypassing NOR programming rules
    pub fn load_image(&self, address: u32, data: &[u8]) -> FsResult<()> {
        let mut cells = self.cells.lock();
        let start = address as usize;
        let end = start.checked_add(data.len()).ok_or(FsError::OutOfBounds)?;
        let target = cells.data.get_mut(start..end).ok_or(FsError::OutOfBounds)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn range(&self, address: u32, len: usize) -> FsResult<core::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(FsError::OutOfBounds)?;
        if end > self.sector_size as usize * self.sector_count as usize {
            return Err(FsError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl NorFlash for RamNorFlash {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> FsResult<()> {
        let range = self.range(address, buf.len())?;
        let cells = self.cells.lock();
        if cells.powered_off() {
            return Err(FsError::Io);
        }
        buf.copy_from_slice(&cells.data[range]);
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> FsResult<()> {
        let range = self.range(address, data.len())?;
        let mut cells = self.cells.lock();
        if cells.powered_off() && !data.is_empty() {
            return Err(FsError::Io);
        }
        let granted = cells.take(data.len());
        for (cell, byte) in cells.data[range].iter_mut().zip(&data[..granted]) {
            *cell &= *byte;
        }
        if granted < data.len() {
            return Err(FsError::Io);
        }
        Ok(())
    }

    fn sector_erase(&self, address: u32) -> FsResult<()> {
        let sector = address / self.sector_size;
        if sector >= self.sector_count {
            return Err(FsError::OutOfBounds);
        }
        let mut cells = self.cells.lock();
        if cells.powered_off() {
            return Err(FsError::Io);
        }
        let start = (sector * self.sector_size) as usize;
        cells.data[start..start + self.sector_size as usize].fill(0xFF);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programming_only_clears_bits() {
        let flash = RamNorFlash::new(64, 2);
        flash.write(0, &[0b1010_1010]).expect("write");
        flash.write(0, &[0b0110_0110]).expect("write");
        let mut buf = [0u8; 2];
        flash.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0b0010_0010, 0xFF]);

        flash.sector_erase(10).expect("erase");
        flash.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0xFF, 0xFF]);
    }

    #[test]
    fn power_cut_stops_mid_write() {
        let flash = RamNorFlash::new(64, 2);
        flash.cut_power_after(3);
        assert_eq!(flash.write(0, &[0u8; 5]), Err(FsError::Io));
        assert_eq!(flash.sector_erase(0), Err(FsError::Io));
        flash.restore_power();

        let mut buf = [0u8; 5];
        flash.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let flash = RamNorFlash::new(64, 2);
        let mut buf = [0u8; 4];
        assert_eq!(flash.read(126, &mut buf), Err(FsError::OutOfBounds));
        assert_eq!(flash.sector_erase(128), Err(FsError::OutOfBounds));
        assert_eq!(flash.load_image(127, &[0, 0]), Err(FsError::OutOfBounds));
    }
}
