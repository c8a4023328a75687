use onlyerror::Error;

/// Errors reported by the flash partition and the filesystem engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// A session of this kind is already open
    #[error("session already in use")]
    Busy,
    /// No session of this kind is open
    #[error("no open session")]
    NoSession,
    /// Address, size or file index outside the valid range
    #[error("address or index out of range")]
    OutOfBounds,
    /// The flash device failed a read, write or erase
    #[error("flash I/O failure")]
    Io,
    /// On-flash structures are inconsistent
    #[error("corrupted on-flash structure")]
    Corrupted,
    /// The file would overwrite its own first sector
    #[error("file does not fit in the partition")]
    NoSpace,
    /// Partition geometry or configuration is unusable
    #[error("invalid configuration")]
    InvalidConfig,
}

pub type FsResult<T> = Result<T, FsError>;
