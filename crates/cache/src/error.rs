use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown cache mode {0}")]
    UnknownCacheMode(u8),

    #[error("backing store miss")]
    BackingStoreMiss,

    #[error("no evictable entries remain on a full page")]
    NoCandidates,
}

pub type CacheResult<T> = Result<T, CacheError>;
