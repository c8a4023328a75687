//! Log structured file engine on top of a [`FlashPartition`].
//!
//! Sectors are used as a circular buffer. Each file starts on a fresh sector
//! with a [`FileHeader`], every sector of the file carries a
//! [`FileDataHeader`], and files are chained through `next_file_sector`.
//! Nothing but the two session cursors lives in RAM.

use log::{debug, info};
use spin::Mutex;

use crate::error::{FsError, FsResult};
use crate::flash::FlashPartition;
use crate::record::{
    ContentRole, FileDataHeader, FileHeader, SectorHeader, SectorRole, StartFsHeader,
    FILE_DATA_HEADER_SIZE, FILE_HEADER_SIZE, FS_VERSION, SECTOR_HEADER_SIZE,
    START_FS_HEADER_SIZE,
};
use crate::session::{ReadSession, WriteSession};
use crate::{FileInfo, FileSystem};

const VERSION_STRING: &str = "NOR flash file system v1.0.0";

/// Smallest sector able to hold every header of the anchor sector plus data
const MIN_SECTOR_SIZE: u32 =
    SECTOR_HEADER_SIZE + START_FS_HEADER_SIZE + FILE_HEADER_SIZE + FILE_DATA_HEADER_SIZE + 1;

/// Decoded headers of a valid sector
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectorLayout {
    pub content: ContentRole,
    /// Partition address right after the sector header(s)
    pub content_address: u32,
}

/// Payload sector of a file as found on flash
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataSector {
    pub sector: u32,
    pub header_address: u32,
    pub header: FileDataHeader,
    pub payload: u32,
    /// Payload bytes the sector can hold
    pub capacity: u32,
}

impl DataSector {
    /// Recorded payload size, bounded by the sector
    pub fn data_size(&self) -> u32 {
        self.header.data_size.unwrap_or(0).min(self.capacity)
    }
}

/// Oldest file about to lose its first sector
#[derive(Debug, Clone, Copy)]
pub(crate) struct Eviction {
    id: u32,
    next_oldest: u32,
}

pub(crate) struct FsState<P> {
    pub flash: P,
    pub file_count: u32,
    pub next_file_id: u32,
    pub oldest_file_sector: u32,
    /// Start sector of the newest closed file, new files go right after it
    pub newest_file_sector: Option<u32>,
    pub writer: Option<WriteSession>,
    pub reader: Option<ReadSession>,
}

/// NOR flash file system
pub struct NorFlashFs<P: FlashPartition> {
    state: Mutex<FsState<P>>,
}

impl<P: FlashPartition> NorFlashFs<P> {
    /// Wrap a partition, [`FileSystem::init`] must be called before use
    pub fn new(flash: P) -> FsResult<Self> {
        if flash.sector_count() < 2 || flash.sector_size() < MIN_SECTOR_SIZE {
            return Err(FsError::InvalidConfig);
        }
        Ok(Self {
            state: Mutex::new(FsState::new(flash)),
        })
    }

    /// Give back the partition
    pub fn into_partition(self) -> P {
        self.state.into_inner().flash
    }
}

impl<P: FlashPartition> FileSystem for NorFlashFs<P> {
    fn version_string(&self) -> &'static str {
        VERSION_STRING
    }

    fn init(&self) -> FsResult<()> {
        self.state.lock().mount()
    }

    fn format(&self) -> FsResult<()> {
        self.state.lock().format()
    }

    fn file_count(&self) -> u32 {
        self.state.lock().file_count
    }

    fn create_file(&self, name: &str) -> FsResult<()> {
        self.state.lock().create_file(name)
    }

    fn write_to_file(&self, data: &[u8]) -> FsResult<()> {
        self.state.lock().write_to_file(data)
    }

    fn close_written_file(&self) -> FsResult<()> {
        self.state.lock().close_written_file()
    }

    fn open_file(&self, index: u32) -> FsResult<FileInfo> {
        self.state.lock().open_file(index)
    }

    fn read_from_file(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.state.lock().read_from_file(buf)
    }

    fn close_read_file(&self) -> FsResult<()> {
        self.state.lock().reader.take().map(|_| ()).ok_or(FsError::NoSession)
    }
}

impl<P: FlashPartition> FsState<P> {
    fn new(flash: P) -> Self {
        Self {
            flash,
            file_count: 0,
            next_file_id: 1,
            oldest_file_sector: 0,
            newest_file_sector: None,
            writer: None,
            reader: None,
        }
    }

    pub(crate) fn sector_address(&self, sector: u32) -> u32 {
        sector * self.flash.sector_size()
    }

    pub(crate) fn sector_end(&self, sector: u32) -> u32 {
        self.sector_address(sector) + self.flash.sector_size()
    }

    pub(crate) fn next_sector(&self, sector: u32) -> u32 {
        (sector + 1) % self.flash.sector_count()
    }

    /// First content byte, after the anchor header on sector 0
    pub(crate) fn content_address(&self, sector: u32) -> u32 {
        let address = self.sector_address(sector) + SECTOR_HEADER_SIZE;
        if sector == 0 {
            address + START_FS_HEADER_SIZE
        } else {
            address
        }
    }

    pub(crate) fn reset_empty(&mut self) {
        self.file_count = 0;
        self.next_file_id = 1;
        self.oldest_file_sector = 0;
        self.newest_file_sector = None;
        self.writer = None;
        self.reader = None;
    }

    pub(crate) fn format(&mut self) -> FsResult<()> {
        self.flash.full_erase()?;
        self.flash.write(
            SECTOR_HEADER_SIZE,
            &StartFsHeader::new(ContentRole::Reserved).encode(),
        )?;
        self.flash
            .write(0, &SectorHeader::new(SectorRole::StartOfFs).encode())?;
        self.reset_empty();
        info!(
            "formatted {} sectors of {} bytes",
            self.flash.sector_count(),
            self.flash.sector_size()
        );
        Ok(())
    }

    /// Decode the headers of `sector`, `None` if it is erased or corrupted
    pub(crate) fn read_layout(&self, sector: u32) -> FsResult<Option<SectorLayout>> {
        let address = self.sector_address(sector);
        let mut raw = [0u8; SECTOR_HEADER_SIZE as usize];
        self.flash.read(address, &mut raw)?;
        let Some(header) = SectorHeader::decode(&raw) else {
            return Ok(None);
        };
        let content = match (header.role, sector) {
            (SectorRole::StartOfFs, 0) => {
                let mut raw = [0u8; START_FS_HEADER_SIZE as usize];
                self.flash.read(address + SECTOR_HEADER_SIZE, &mut raw)?;
                match StartFsHeader::decode(&raw) {
                    Some(anchor) if anchor.version == FS_VERSION => anchor.content,
                    _ => return Ok(None),
                }
            }
            (SectorRole::StartOfFile, s) if s != 0 => ContentRole::StartOfFile,
            (SectorRole::FileData, s) if s != 0 => ContentRole::FileData,
            _ => return Ok(None),
        };
        Ok(Some(SectorLayout {
            content,
            content_address: self.content_address(sector),
        }))
    }

    pub(crate) fn read_file_header(&self, address: u32) -> FsResult<FileHeader> {
        let mut raw = [0u8; FILE_HEADER_SIZE as usize];
        self.flash.read(address, &mut raw)?;
        Ok(FileHeader::decode(&raw))
    }

    pub(crate) fn read_data_header(&self, address: u32) -> FsResult<FileDataHeader> {
        let mut raw = [0u8; FILE_DATA_HEADER_SIZE as usize];
        self.flash.read(address, &mut raw)?;
        Ok(FileDataHeader::decode(&raw))
    }

    /// Patch size and chain pointer of a finished data sector
    pub(crate) fn close_data_sector(
        &self,
        data_header_address: u32,
        data_size: u32,
        next_data_sector: Option<u32>,
    ) -> FsResult<()> {
        self.flash.write(
            data_header_address + FileDataHeader::CLOSE_PATCH_OFFSET,
            &FileDataHeader::close_patch(data_size, next_data_sector),
        )
    }

    /// Patch size and chain pointer of the file starting at `file_sector`
    pub(crate) fn close_file_header(
        &self,
        file_sector: u32,
        size: u32,
        next_file_sector: u32,
    ) -> FsResult<()> {
        match self.read_layout(file_sector)? {
            Some(layout) if layout.content == ContentRole::StartOfFile => self.flash.write(
                layout.content_address + FileHeader::CLOSE_PATCH_OFFSET,
                &FileHeader::close_patch(size, next_file_sector),
            ),
            _ => Err(FsError::Corrupted),
        }
    }

    /// Check whether reusing `sector` destroys the oldest file, without touching flash
    fn plan_reuse(&self, sector: u32) -> FsResult<Option<Eviction>> {
        if self.file_count == 0 || sector != self.oldest_file_sector {
            return Ok(None);
        }
        let layout = match self.read_layout(sector)? {
            Some(layout) if layout.content == ContentRole::StartOfFile => layout,
            _ => return Ok(None),
        };
        let header = self.read_file_header(layout.content_address)?;
        if self.reader.as_ref().is_some_and(|r| r.file_id == header.id) {
            debug!("file {} is being read, sector {} cannot be reused", header.id, sector);
            return Err(FsError::Busy);
        }
        Ok(Some(Eviction {
            id: header.id,
            next_oldest: self.file_next_sector(sector, &header)?,
        }))
    }

    /// Sector receiving the next created file
    fn next_create_sector(&self) -> FsResult<u32> {
        let Some(newest) = self.newest_file_sector else {
            return Ok(0);
        };
        let layout = self
            .read_layout(newest)?
            .filter(|l| l.content == ContentRole::StartOfFile)
            .ok_or(FsError::Corrupted)?;
        let header = self.read_file_header(layout.content_address)?;
        self.file_next_sector(newest, &header)
    }

    /// Apply `eviction` and erase `sector`, returns its content address
    fn erase_for_write(&mut self, sector: u32, eviction: Option<Eviction>) -> FsResult<u32> {
        if let Some(eviction) = eviction {
            debug!("evicting file {} from sector {}", eviction.id, sector);
            self.oldest_file_sector = eviction.next_oldest;
            self.file_count = self.file_count.saturating_sub(1);
        }
        self.flash.sector_erase(self.sector_address(sector))?;
        Ok(self.content_address(sector))
    }

    /// Write the sector header last so a torn open reads back as an erased sector
    fn commit_sector(&self, sector: u32, content: ContentRole) -> FsResult<()> {
        let address = self.sector_address(sector);
        let role = if sector == 0 {
            self.flash.write(
                address + SECTOR_HEADER_SIZE,
                &StartFsHeader::new(content).encode(),
            )?;
            SectorRole::StartOfFs
        } else if content == ContentRole::StartOfFile {
            SectorRole::StartOfFile
        } else {
            SectorRole::FileData
        };
        self.flash.write(address, &SectorHeader::new(role).encode())
    }

    fn create_file(&mut self, name: &str) -> FsResult<()> {
        if self.writer.is_some() {
            return Err(FsError::Busy);
        }
        let sector = self.next_create_sector()?;
        let eviction = self.plan_reuse(sector)?;
        let content_address = self.erase_for_write(sector, eviction)?;

        let id = self.next_file_id;
        self.flash
            .write(content_address, &FileHeader::open(id, name).encode())?;
        let data_header_address = content_address + FILE_HEADER_SIZE;
        self.flash
            .write(data_header_address, &FileDataHeader::open(id, sector).encode())?;
        self.commit_sector(sector, ContentRole::StartOfFile)?;

        self.next_file_id += 1;
        self.writer = Some(WriteSession::new(
            id,
            sector,
            data_header_address,
            self.sector_end(sector),
        ));
        debug!("created file {} '{}' at sector {}", id, name, sector);
        Ok(())
    }

    fn write_to_file(&mut self, data: &[u8]) -> FsResult<()> {
        let mut session = self.writer.take().ok_or(FsError::NoSession)?;
        let result = self.append(&mut session, data);
        self.writer = Some(session);
        result
    }

    fn append(&mut self, session: &mut WriteSession, mut data: &[u8]) -> FsResult<()> {
        loop {
            let chunk = data.len().min(session.room() as usize);
            if chunk > 0 {
                self.flash.write(session.address, &data[..chunk])?;
                session.advance(chunk as u32);
                data = &data[chunk..];
            }
            if data.is_empty() {
                return Ok(());
            }
            self.roll_over(session)?;
        }
    }

    /// Close the full sector of `session` and continue on the next one
    fn roll_over(&mut self, session: &mut WriteSession) -> FsResult<()> {
        let next = self.next_sector(session.current_sector);
        if next == session.file_sector {
            return Err(FsError::NoSpace);
        }
        let eviction = self.plan_reuse(next)?;
        self.close_data_sector(
            session.data_header_address,
            session.sector_data_size,
            Some(next),
        )?;
        let content_address = self.erase_for_write(next, eviction)?;
        self.flash.write(
            content_address,
            &FileDataHeader::open(session.file_id, session.file_sector).encode(),
        )?;
        self.commit_sector(next, ContentRole::FileData)?;

        session.enter_sector(next, content_address, self.sector_end(next));
        debug!("file {} continues on sector {}", session.file_id, next);
        Ok(())
    }

    fn close_written_file(&mut self) -> FsResult<()> {
        let session = self.writer.clone().ok_or(FsError::NoSession)?;
        let next_file_sector = self.next_sector(session.current_sector);
        self.close_data_sector(session.data_header_address, session.sector_data_size, None)?;
        self.close_file_header(session.file_sector, session.file_size, next_file_sector)?;

        self.writer = None;
        if self.file_count == 0 {
            self.oldest_file_sector = session.file_sector;
        }
        self.file_count += 1;
        self.newest_file_sector = Some(session.file_sector);
        debug!(
            "closed file {}: {} bytes, next file at sector {}",
            session.file_id, session.file_size, next_file_sector
        );
        Ok(())
    }

    fn open_file(&mut self, index: u32) -> FsResult<FileInfo> {
        if self.reader.is_some() {
            return Err(FsError::Busy);
        }
        if index >= self.file_count {
            return Err(FsError::OutOfBounds);
        }

        let mut sector = self.oldest_file_sector;
        let mut hops = 0;
        let (layout, header) = loop {
            let layout = self
                .read_layout(sector)?
                .filter(|l| l.content == ContentRole::StartOfFile)
                .ok_or(FsError::Corrupted)?;
            let header = self.read_file_header(layout.content_address)?;
            if hops == index {
                break (layout, header);
            }
            sector = self.file_next_sector(sector, &header)?;
            hops += 1;
        };

        let size = match header.size {
            Some(size) if size <= self.flash.size() => size,
            // size patch torn by a power cut
            _ => {
                let mut total = 0;
                self.visit_data_chain(sector, header.id, |data| {
                    total += data.data_size();
                    Ok(())
                })?;
                total
            }
        };
        let first = self.data_sector(sector, layout.content_address + FILE_HEADER_SIZE)?;
        if !first.header.belongs_to(header.id, sector) {
            return Err(FsError::Corrupted);
        }
        let mut session = ReadSession {
            file_id: header.id,
            file_sector: sector,
            current_sector: sector,
            address: first.payload,
            sector_left: 0,
            file_left: size,
            next_data_sector: None,
        };
        session.enter_sector(
            sector,
            first.payload,
            first.data_size(),
            first.header.next_data_sector,
        );
        self.reader = Some(session);
        debug!("opened file {} '{}' ({} bytes)", header.id, header.name, size);
        Ok(FileInfo {
            size,
            name: header.name,
        })
    }

    /// Sector of the file created after the one starting at `sector`
    fn file_next_sector(&self, sector: u32, header: &FileHeader) -> FsResult<u32> {
        match header.next_file_sector {
            Some(next) if next < self.flash.sector_count() => Ok(next),
            _ => {
                let last = self.visit_data_chain(sector, header.id, |_| Ok(()))?;
                Ok(self.next_sector(last))
            }
        }
    }

    pub(crate) fn data_sector(&self, sector: u32, header_address: u32) -> FsResult<DataSector> {
        let header = self.read_data_header(header_address)?;
        let payload = header_address + FILE_DATA_HEADER_SIZE;
        Ok(DataSector {
            sector,
            header_address,
            header,
            payload,
            capacity: self.sector_end(sector) - payload,
        })
    }

    /// Visit the data sectors of file `id` in order, returns the last one.
    ///
    /// The walk stops at the first sector that is not a data sector of the
    /// file, so a chain cut by a power loss ends at its last intact sector.
    pub(crate) fn visit_data_chain(
        &self,
        file_sector: u32,
        id: u32,
        mut visit: impl FnMut(&DataSector) -> FsResult<()>,
    ) -> FsResult<u32> {
        let count = self.flash.sector_count();
        let start = self
            .read_layout(file_sector)?
            .filter(|l| l.content == ContentRole::StartOfFile)
            .ok_or(FsError::Corrupted)?;
        let mut current = self.data_sector(file_sector, start.content_address + FILE_HEADER_SIZE)?;
        if !current.header.belongs_to(id, file_sector) {
            return Err(FsError::Corrupted);
        }
        for _ in 0..count {
            visit(&current)?;
            let Some(next) = current
                .header
                .next_data_sector
                .filter(|&s| s < count && s != file_sector)
            else {
                break;
            };
            let Some(layout) = self
                .read_layout(next)?
                .filter(|l| l.content == ContentRole::FileData)
            else {
                break;
            };
            let candidate = self.data_sector(next, layout.content_address)?;
            if !candidate.header.belongs_to(id, file_sector) {
                break;
            }
            current = candidate;
        }
        Ok(current.sector)
    }

    fn read_from_file(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let mut session = self.reader.take().ok_or(FsError::NoSession)?;
        let result = self.stream(&mut session, buf);
        self.reader = Some(session);
        result
    }

    fn stream(&self, session: &mut ReadSession, buf: &mut [u8]) -> FsResult<usize> {
        let mut read = 0;
        while read < buf.len() && session.file_left > 0 {
            if session.sector_left == 0 {
                self.enter_next_data_sector(session)?;
                continue;
            }
            let chunk = (buf.len() - read)
                .min(session.sector_left as usize)
                .min(session.file_left as usize);
            self.flash
                .read(session.address, &mut buf[read..read + chunk])?;
            session.consume(chunk as u32);
            read += chunk;
        }
        Ok(read)
    }

    fn enter_next_data_sector(&self, session: &mut ReadSession) -> FsResult<()> {
        let sector = session
            .next_data_sector
            .filter(|&s| s < self.flash.sector_count())
            .ok_or(FsError::Corrupted)?;
        let layout = self
            .read_layout(sector)?
            .filter(|l| l.content == ContentRole::FileData)
            .ok_or(FsError::Corrupted)?;
        let data = self.data_sector(sector, layout.content_address)?;
        if !data.header.belongs_to(session.file_id, session.file_sector) {
            return Err(FsError::Corrupted);
        }
        // a sector is only left once full, an empty one cannot precede more data
        if data.data_size() == 0 {
            return Err(FsError::Corrupted);
        }
        session.enter_sector(
            sector,
            data.payload,
            data.data_size(),
            data.header.next_data_sector,
        );
        debug!("file {} read continues on sector {}", session.file_id, session.current_sector);
        Ok(())
    }
}
