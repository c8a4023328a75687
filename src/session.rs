//! Cursors of the write and read sessions.
//!
//! A session value only exists while the file is open, the engine keeps it
//! in an `Option`.

/// File being appended to
#[derive(Debug, Clone)]
pub(crate) struct WriteSession {
    pub file_id: u32,
    /// Sector holding the file header
    pub file_sector: u32,
    pub current_sector: u32,
    /// Partition address of the data header of `current_sector`
    pub data_header_address: u32,
    /// Next partition address to program
    pub address: u32,
    /// First address past `current_sector`
    pub sector_end: u32,
    pub file_size: u32,
    pub sector_data_size: u32,
}

impl WriteSession {
    pub fn new(file_id: u32, file_sector: u32, data_header_address: u32, sector_end: u32) -> Self {
        let mut session = Self {
            file_id,
            file_sector,
            current_sector: file_sector,
            data_header_address,
            address: 0,
            sector_end,
            file_size: 0,
            sector_data_size: 0,
        };
        session.enter_sector(file_sector, data_header_address, sector_end);
        session
    }

    /// Bytes left in the current sector
    pub fn room(&self) -> u32 {
        self.sector_end - self.address
    }

    pub fn advance(&mut self, len: u32) {
        self.address += len;
        self.file_size += len;
        self.sector_data_size += len;
    }

    pub fn enter_sector(&mut self, sector: u32, data_header_address: u32, sector_end: u32) {
        self.current_sector = sector;
        self.data_header_address = data_header_address;
        self.address = data_header_address + crate::record::FILE_DATA_HEADER_SIZE;
        self.sector_end = sector_end;
        self.sector_data_size = 0;
    }
}

/// File being streamed out
#[derive(Debug, Clone)]
pub(crate) struct ReadSession {
    pub file_id: u32,
    pub file_sector: u32,
    pub current_sector: u32,
    /// Next partition address to read
    pub address: u32,
    pub sector_left: u32,
    pub file_left: u32,
    pub next_data_sector: Option<u32>,
}

impl ReadSession {
    pub fn consume(&mut self, len: u32) {
        self.address += len;
        self.sector_left -= len;
        self.file_left -= len;
    }

    pub fn enter_sector(
        &mut self,
        sector: u32,
        payload_address: u32,
        data_size: u32,
        next_data_sector: Option<u32>,
    ) {
        self.current_sector = sector;
        self.address = payload_address;
        self.sector_left = data_size;
        self.next_data_sector = next_data_sector;
    }
}
