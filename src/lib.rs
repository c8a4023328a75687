#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod config;
pub mod error;
pub mod flash;
pub mod fs;
pub mod ram_flash;
pub mod record;
mod recovery;
mod session;


use alloc::string::String;

pub use config::PartitionConfig;
pub use error::{FsError, FsResult};
pub use flash::{FlashPartition, NorFlash, NorFlashPartition};
pub use fs::NorFlashFs;
pub use ram_flash::RamNorFlash;

/// Metadata returned when a file is opened for reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u32,
    pub name: String,
}

/// Append only flight log store.
///
/// At most one file is written and one file is read at a time; files are
/// addressed by their index from the oldest one.
pub trait FileSystem: Send + Sync {
    fn version_string(&self) -> &'static str;
    /// Mount the file system found on flash, formatting it if none is valid
    fn init(&self) -> FsResult<()>;
    /// Erase every file
    fn format(&self) -> FsResult<()>;
    fn file_count(&self) -> u32;

    /// Start a new file, evicting the oldest one when its sector is needed
    fn create_file(&self, name: &str) -> FsResult<()>;
    fn write_to_file(&self, data: &[u8]) -> FsResult<()>;
    fn close_written_file(&self) -> FsResult<()>;

    /// Open the file at `index`, 0 being the oldest
    fn open_file(&self, index: u32) -> FsResult<FileInfo>;
    /// Returns the number of bytes read, 0 once the whole file was read
    fn read_from_file(&self, buf: &mut [u8]) -> FsResult<usize>;
    fn close_read_file(&self) -> FsResult<()>;
}
