//! Fixed on-flash layout of the sector header and the file records.
//!
//! Every field is stored in native byte order. Fields that are still erased
//! on flash (all ones) decode to `None`, so a record that has not been closed
//! yet is visible in the type instead of through a magic number.

use alloc::string::String;

/// NOR flash file system version : 1.0.0
pub const FS_VERSION: u32 = 0x0010_0000;

pub const SECTOR_HEADER_SIZE: u32 = 4;
pub const START_FS_HEADER_SIZE: u32 = 8;
pub const FILE_HEADER_SIZE: u32 = 80;
pub const FILE_DATA_HEADER_SIZE: u32 = 16;

/// Longest file name kept in a file header, in bytes
pub const MAX_FILENAME_LEN: usize = 63;
const NAME_BUFFER_LEN: usize = MAX_FILENAME_LEN + 1;
const NAME_OFFSET: usize = 16;

const START_MAGIC: u8 = 0xAA;
const END_MAGIC: u8 = 0x55;
const RESERVED: u8 = 0xFF;

/// Value of a 32-bit word that has not been programmed since the last erase
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

macro_rules! ne_u32 {
    ($buf:expr, $off:expr) => {
        u32::from_ne_bytes([$buf[$off], $buf[$off + 1], $buf[$off + 2], $buf[$off + 3]])
    };
}

fn encode_open(value: Option<u32>) -> [u8; 4] {
    value.unwrap_or(ERASED_WORD).to_ne_bytes()
}

fn decode_open(raw: u32) -> Option<u32> {
    (raw != ERASED_WORD).then_some(raw)
}

/// Role written in the header of every sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectorRole {
    StartOfFs = 0x00,
    StartOfFile = 0xAA,
    FileData = 0x55,
}

impl SectorRole {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::StartOfFs),
            0xAA => Some(Self::StartOfFile),
            0x55 => Some(Self::FileData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub role: SectorRole,
}

impl SectorHeader {
    pub fn new(role: SectorRole) -> Self {
        Self { role }
    }

    pub fn encode(&self) -> [u8; SECTOR_HEADER_SIZE as usize] {
        [START_MAGIC, self.role as u8, RESERVED, END_MAGIC]
    }

    /// Returns `None` for an erased or corrupted sector
    pub fn decode(bytes: &[u8; SECTOR_HEADER_SIZE as usize]) -> Option<Self> {
        if bytes[0] != START_MAGIC || bytes[3] != END_MAGIC {
            return None;
        }
        SectorRole::from_u8(bytes[1]).map(Self::new)
    }
}

/// What a sector currently holds, looking through the anchor of sector 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentRole {
    /// Freshly formatted anchor, no file content yet
    Reserved = 0xFF,
    StartOfFile = 0xAA,
    FileData = 0x55,
}

impl ContentRole {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xFF => Some(Self::Reserved),
            0xAA => Some(Self::StartOfFile),
            0x55 => Some(Self::FileData),
            _ => None,
        }
    }
}

/// Extra header carried by sector 0 after its sector header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartFsHeader {
    pub version: u32,
    pub content: ContentRole,
}

impl StartFsHeader {
    pub fn new(content: ContentRole) -> Self {
        Self {
            version: FS_VERSION,
            content,
        }
    }

    pub fn encode(&self) -> [u8; START_FS_HEADER_SIZE as usize] {
        let mut out = [RESERVED; START_FS_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.version.to_ne_bytes());
        out[4] = self.content as u8;
        out
    }

    pub fn decode(bytes: &[u8; START_FS_HEADER_SIZE as usize]) -> Option<Self> {
        let content = ContentRole::from_u8(bytes[4])?;
        Some(Self {
            version: ne_u32!(bytes, 0),
            content,
        })
    }
}

/// Header at the start of the first sector of every file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub id: u32,
    pub size: Option<u32>,
    pub next_file_sector: Option<u32>,
    pub name: String,
}

impl FileHeader {
    /// Offset of the `size` and `next_file_sector` pair patched on close
    pub const CLOSE_PATCH_OFFSET: u32 = 4;

    /// Header of a file that is still being written
    pub fn open(id: u32, name: &str) -> Self {
        Self {
            id,
            size: None,
            next_file_sector: None,
            name: String::from(truncate_name(name)),
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut out = [0u8; FILE_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.id.to_ne_bytes());
        out[4..8].copy_from_slice(&encode_open(self.size));
        out[8..12].copy_from_slice(&encode_open(self.next_file_sector));
        out[12..15].fill(RESERVED);
        let name = truncate_name(&self.name).as_bytes();
        out[15] = name.len() as u8;
        out[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
        out
    }

    pub fn decode(bytes: &[u8; FILE_HEADER_SIZE as usize]) -> Self {
        let name_length = usize::from(bytes[15]).min(MAX_FILENAME_LEN);
        let name = &bytes[NAME_OFFSET..NAME_OFFSET + name_length];
        Self {
            id: ne_u32!(bytes, 0),
            size: decode_open(ne_u32!(bytes, 4)),
            next_file_sector: decode_open(ne_u32!(bytes, 8)),
            name: String::from_utf8_lossy(name).into_owned(),
        }
    }

    pub fn close_patch(size: u32, next_file_sector: u32) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&size.to_ne_bytes());
        out[4..8].copy_from_slice(&next_file_sector.to_ne_bytes());
        out
    }
}

/// Header at the start of the payload of every sector of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDataHeader {
    pub id: u32,
    pub file_start_sector: u32,
    pub data_size: Option<u32>,
    pub next_data_sector: Option<u32>,
}

impl FileDataHeader {
    /// Offset of the `data_size` and `next_data_sector` pair patched on close
    pub const CLOSE_PATCH_OFFSET: u32 = 8;

    pub fn open(id: u32, file_start_sector: u32) -> Self {
        Self {
            id,
            file_start_sector,
            data_size: None,
            next_data_sector: None,
        }
    }

    /// Whether this header was written by the file `id` starting at `start`
    pub fn belongs_to(&self, id: u32, start: u32) -> bool {
        self.id == id && self.file_start_sector == start
    }

    pub fn encode(&self) -> [u8; FILE_DATA_HEADER_SIZE as usize] {
        let mut out = [0u8; FILE_DATA_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.file_start_sector.to_ne_bytes());
        out[8..12].copy_from_slice(&encode_open(self.data_size));
        out[12..16].copy_from_slice(&encode_open(self.next_data_sector));
        out
    }

    pub fn decode(bytes: &[u8; FILE_DATA_HEADER_SIZE as usize]) -> Self {
        Self {
            id: ne_u32!(bytes, 0),
            file_start_sector: ne_u32!(bytes, 4),
            data_size: decode_open(ne_u32!(bytes, 8)),
            next_data_sector: decode_open(ne_u32!(bytes, 12)),
        }
    }

    /// A last sector keeps `next_data_sector` erased
    pub fn close_patch(data_size: u32, next_data_sector: Option<u32>) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&data_size.to_ne_bytes());
        out[4..8].copy_from_slice(&encode_open(next_data_sector));
        out
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_FILENAME_LEN {
        return name;
    }
    let mut end = MAX_FILENAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_header_layout() {
        let bytes = SectorHeader::new(SectorRole::FileData).encode();
        assert_eq!(bytes, [0xAA, 0x55, 0xFF, 0x55]);
        assert_eq!(
            SectorHeader::decode(&bytes),
            Some(SectorHeader::new(SectorRole::FileData))
        );
    }

    #[test]
    fn erased_or_damaged_sector_header_is_invalid() {
        assert_eq!(SectorHeader::decode(&[0xFF; 4]), None);
        assert_eq!(SectorHeader::decode(&[0xAA, 0xAA, 0xFF, 0x54]), None);
        assert_eq!(SectorHeader::decode(&[0xAA, 0x12, 0xFF, 0x55]), None);
    }

    #[test]
    fn start_fs_header_rejects_unknown_role() {
        let mut bytes = StartFsHeader::new(ContentRole::Reserved).encode();
        assert_eq!(&bytes[4..], &[0xFF; 4]);
        assert_eq!(
            StartFsHeader::decode(&bytes).map(|h| h.version),
            Some(FS_VERSION)
        );
        bytes[4] = 0x42;
        assert_eq!(StartFsHeader::decode(&bytes), None);
    }

    #[test]
    fn open_file_header_keeps_fields_erased() {
        let bytes = FileHeader::open(7, "flight-001").encode();
        assert_eq!(&bytes[4..15], &[0xFF; 11]);
        let header = FileHeader::decode(&bytes);
        assert_eq!(header.id, 7);
        assert_eq!(header.size, None);
        assert_eq!(header.next_file_sector, None);
        assert_eq!(header.name, "flight-001");
    }

    #[test]
    fn close_patch_matches_closed_header() {
        let mut header = FileHeader::open(3, "x");
        header.size = Some(1234);
        header.next_file_sector = Some(9);
        let offset = FileHeader::CLOSE_PATCH_OFFSET as usize;
        assert_eq!(
            &header.encode()[offset..offset + 8],
            &FileHeader::close_patch(1234, 9)
        );

        let mut data = FileDataHeader::open(3, 2);
        data.data_size = Some(40);
        let offset = FileDataHeader::CLOSE_PATCH_OFFSET as usize;
        assert_eq!(
            &data.encode()[offset..offset + 8],
            &FileDataHeader::close_patch(40, None)
        );
    }

    #[test]
    fn long_names_are_cut_on_a_char_boundary() {
        let name: String = core::iter::repeat('é').take(40).collect();
        let header = FileHeader::open(1, &name);
        assert!(header.name.len() <= MAX_FILENAME_LEN);
        assert_eq!(header.name.chars().count(), 31);
        assert_eq!(FileHeader::decode(&header.encode()).name, header.name);
    }
}
