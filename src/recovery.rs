//! Boot time reconstruction of the engine state from the on-flash headers.
//!
//! The file chain is walked from an entry file, following `next_file_sector`
//! until the first file is met again. A file whose header was never closed is
//! the one being written when power was lost: its extent is measured from its
//! data sectors and the close patches are applied as if it had been closed.

use log::{debug, info, warn};

use crate::error::FsResult;
use crate::flash::FlashPartition;
use crate::fs::{FsState, SectorLayout};
use crate::record::{ContentRole, FileHeader, ERASED_WORD};

/// What a walk of the file chain found
#[derive(Debug, Clone, Copy)]
struct ChainSummary {
    file_count: u32,
    first_id: u32,
    /// (id, sector) of the file with the lowest id
    oldest: (u32, u32),
    /// (id, sector) of the file with the highest id
    newest: (u32, u32),
}

impl ChainSummary {
    fn new(id: u32, sector: u32) -> Self {
        Self {
            file_count: 1,
            first_id: id,
            oldest: (id, sector),
            newest: (id, sector),
        }
    }

    fn add(&mut self, id: u32, sector: u32) {
        self.file_count += 1;
        if id < self.oldest.0 {
            self.oldest = (id, sector);
        }
        if id > self.newest.0 {
            self.newest = (id, sector);
        }
    }
}

impl<P: FlashPartition> FsState<P> {
    /// Rebuild the state from flash, formatting when no file system is found
    pub(crate) fn mount(&mut self) -> FsResult<()> {
        self.writer = None;
        self.reader = None;

        let entry = match self.read_layout(0)? {
            Some(anchor) => match anchor.content {
                ContentRole::Reserved => {
                    self.reset_empty();
                    info!("mounted empty file system");
                    return Ok(());
                }
                ContentRole::StartOfFile => Some(0),
                ContentRole::FileData => self.find_chain_entry(&anchor)?,
            },
            // power lost while sector 0 was rewritten for a new file
            None if self.anchor_unwritten()? => self.find_oldest_start()?,
            None => None,
        };

        let summary = match entry {
            Some(entry) => self.walk_chain(entry)?,
            None => None,
        };
        let Some(summary) = summary else {
            warn!("no valid file chain found, formatting");
            return self.format();
        };

        self.file_count = summary.file_count;
        self.next_file_id = summary.newest.0 + 1;
        self.oldest_file_sector = summary.oldest.1;
        self.newest_file_sector = Some(summary.newest.1);
        info!(
            "mounted {} files, oldest at sector {}, newest at sector {:?}, next file id {}",
            self.file_count, self.oldest_file_sector, self.newest_file_sector, self.next_file_id
        );
        Ok(())
    }

    /// Whether the sector 0 header was never completed since its last erase
    fn anchor_unwritten(&self) -> FsResult<bool> {
        let mut raw = [0u8; 4];
        self.flash.read(0, &mut raw)?;
        Ok(raw[3] == 0xFF)
    }

    /// Entry file when sector 0 holds a data sector
    fn find_chain_entry(&self, anchor: &SectorLayout) -> FsResult<Option<u32>> {
        let data = self.read_data_header(anchor.content_address)?;
        let start = data.file_start_sector;
        if start != 0 && start < self.flash.sector_count() {
            if let Some(layout) = self
                .read_layout(start)?
                .filter(|l| l.content == ContentRole::StartOfFile)
            {
                if self.read_file_header(layout.content_address)?.id == data.id {
                    return Ok(Some(start));
                }
            }
        }
        debug!(
            "sector 0 holds stale data of file {}, scanning for the oldest file",
            data.id
        );
        self.find_oldest_start()
    }

    /// Start sector of the file with the lowest id
    fn find_oldest_start(&self) -> FsResult<Option<u32>> {
        let mut oldest: Option<(u32, u32)> = None;
        for sector in 1..self.flash.sector_count() {
            let Some(layout) = self
                .read_layout(sector)?
                .filter(|l| l.content == ContentRole::StartOfFile)
            else {
                continue;
            };
            let id = self.read_file_header(layout.content_address)?.id;
            if oldest.map_or(true, |(lowest, _)| id < lowest) {
                oldest = Some((id, sector));
            }
        }
        Ok(oldest.map(|(_, sector)| sector))
    }

    /// Walk the file chain from `entry`, `None` when no usable chain exists.
    ///
    /// Sectors between the newest and the oldest file hold erased or stale
    /// data of evicted files and are stepped over one by one. Ids grow along
    /// the chain and drop once at most, when the walk passes from the newest
    /// file to the oldest.
    fn walk_chain(&self, entry: u32) -> FsResult<Option<ChainSummary>> {
        let count = self.flash.sector_count();
        let mut summary: Option<ChainSummary> = None;
        let mut sector = entry;
        let mut last_id = 0;
        let mut dropped = false;

        for _ in 0..=2 * count {
            let start = self
                .read_layout(sector)?
                .filter(|l| l.content == ContentRole::StartOfFile);
            let Some(layout) = start else {
                if summary.is_none() {
                    return Ok(None);
                }
                sector = self.next_sector(sector);
                continue;
            };

            let header = self.read_file_header(layout.content_address)?;
            if let Some(summary) = summary.as_ref() {
                if header.id == summary.first_id {
                    return Ok(Some(*summary));
                }
                if header.id < last_id {
                    if dropped {
                        warn!("file ids drop twice along the chain at sector {}", sector);
                        return Ok(Some(*summary));
                    }
                    dropped = true;
                } else if dropped && header.id > summary.first_id {
                    warn!("file {} at sector {} overlaps the chain start", header.id, sector);
                    return Ok(Some(*summary));
                }
            }

            let next = match header.next_file_sector {
                Some(next) if next < count && header.size.is_some() => next,
                _ => self.recover_open_file(sector, &layout, &header)?,
            };
            match summary.as_mut() {
                Some(summary) => summary.add(header.id, sector),
                None => summary = Some(ChainSummary::new(header.id, sector)),
            }
            last_id = header.id;
            sector = next;
        }

        warn!("file chain does not close within two laps of the partition");
        Ok(None)
    }

    /// Size and close the file left open at `sector`, returns the sector after it
    fn recover_open_file(
        &self,
        sector: u32,
        layout: &SectorLayout,
        header: &FileHeader,
    ) -> FsResult<u32> {
        let mut total = 0;
        let last = self.visit_data_chain(sector, header.id, |data| {
            let size = match data.header.data_size {
                Some(size) if size <= data.capacity => size,
                _ => self.measure_written(data.payload, data.capacity)?,
            };
            if data.header.data_size.is_none() {
                self.close_data_sector(data.header_address, size, None)?;
            }
            total += size;
            Ok(())
        })?;
        let next = self.next_sector(last);

        // fields half programmed by a torn close cannot be patched again
        let patch = FileHeader::close_patch(total, next);
        let address = layout.content_address + FileHeader::CLOSE_PATCH_OFFSET;
        if header.size.is_none() {
            self.flash.write(address, &patch[..4])?;
        }
        if header.next_file_sector.is_none() {
            self.flash.write(address + 4, &patch[4..])?;
        }
        info!(
            "recovered unfinished file {} at sector {}: {} bytes",
            header.id, sector, total
        );
        Ok(next)
    }

    /// Bytes programmed from `payload`, up to the first erased word
    fn measure_written(&self, payload: u32, capacity: u32) -> FsResult<u32> {
        let mut offset = 0;
        let mut word = [0u8; 4];
        while offset + 4 <= capacity {
            self.flash.read(payload + offset, &mut word)?;
            if u32::from_ne_bytes(word) == ERASED_WORD {
                return Ok(offset);
            }
            offset += 4;
        }
        if offset < capacity {
            let tail = &mut word[..(capacity - offset) as usize];
            self.flash.read(payload + offset, tail)?;
            if tail.iter().any(|&b| b != 0xFF) {
                return Ok(capacity);
            }
        }
        Ok(offset)
    }
}
