use thiserror::Error;

/// Errors surfaced by the page/chunk/file layer.
///
/// This sits below `mdbm::MdbmError`'s stable public taxonomy; the top
/// crate maps each variant onto `NotFound` / `NoRoom` / `IoError` / etc. as
/// appropriate for the calling operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number in {what}")]
    BadMagic { what: &'static str },

    #[error("checksum mismatch in {what}")]
    ChecksumMismatch { what: &'static str },

    #[error("corrupt {what}: {reason}")]
    Corrupt {
        what: &'static str,
        reason: String,
    },

    #[error("page is full: need {needed} bytes, have {available}")]
    NoRoom { needed: u32, available: u32 },

    #[error("zero-length key")]
    ZeroLengthKey,

    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    #[error("invalid page size {0}: must be a multiple of 64 in [128, 16MiB-64]")]
    InvalidPageSize(u32),

    #[error("invalid alignment {0}: must be one of 1, 2, 4, 8")]
    InvalidAlignment(u8),

    #[error("file size limit reached: {limit_pages} pages")]
    LimitReached { limit_pages: u32 },

    #[error("no such slot {0} on page")]
    NoSuchSlot(u32),

    #[error("mmap failed: {0}")]
    Mmap(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
