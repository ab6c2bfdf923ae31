//! The public error taxonomy: every lower-layer error funnels into
//! one of these eight kinds. `Exists` is deliberately not a variant here
//! — it travels as `Ok(StoreOutcome::Exists)` instead, matching
//! `MDBM_STORE_ENTRY_EXISTS` being a non-negative return code, never an
//! error.

use thiserror::Error;

use mdbm_cache::CacheError;
use mdbm_directory::DirectoryError;
use mdbm_lock::LockError;
use mdbm_storage::StorageError;

#[derive(Debug, Error)]
pub enum MdbmError {
    #[error("key not found")]
    NotFound,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("no room: {0}")]
    NoRoom(String),

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("lock failed: {0}")]
    LockFailed(String),

    #[error("replace lost the old entry and could not fit the new value (EOVERFLOW)")]
    ReplaceLost,

    #[error("unsupported for this on-disk format: {0}")]
    Unsupported(String),
}

pub type MdbmResult<T> = Result<T, MdbmError>;

/// The non-error result of a `store` call: `Exists` is
/// `MDBM_STORE_ENTRY_EXISTS`, returned only when `StoreMode::Insert`
/// finds the key already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Exists,
}

impl From<StorageError> for MdbmError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NoRoom { .. } | StorageError::LimitReached { .. } => {
                MdbmError::NoRoom(e.to_string())
            }
            StorageError::ZeroLengthKey
            | StorageError::KeyTooLarge(_)
            | StorageError::ValueTooLarge(_)
            | StorageError::InvalidPageSize(_)
            | StorageError::InvalidAlignment(_) => MdbmError::Invalid(e.to_string()),
            StorageError::Io(io) => MdbmError::IoError(io),
            StorageError::BadMagic { .. }
            | StorageError::ChecksumMismatch { .. }
            | StorageError::Corrupt { .. }
            | StorageError::NoSuchSlot(_)
            | StorageError::Mmap(_) => MdbmError::Unsupported(e.to_string()),
        }
    }
}

impl From<DirectoryError> for MdbmError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::LimitReached(_) | DirectoryError::MaxShiftReached(_) => {
                MdbmError::NoRoom(e.to_string())
            }
            DirectoryError::AlreadySplit(_) | DirectoryError::NotALeaf(_) | DirectoryError::Corrupt(_) => {
                MdbmError::Unsupported(e.to_string())
            }
        }
    }
}

impl From<LockError> for MdbmError {
    fn from(e: LockError) -> Self {
        MdbmError::LockFailed(e.to_string())
    }
}

impl From<CacheError> for MdbmError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Io(io) => MdbmError::IoError(io),
            CacheError::NoCandidates => MdbmError::NoRoom(e.to_string()),
            CacheError::UnknownCacheMode(_) | CacheError::BackingStoreMiss => {
                MdbmError::Invalid(e.to_string())
            }
        }
    }
}
