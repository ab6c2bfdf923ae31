use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock would block")]
    WouldBlock,

    #[error("partition index {index} out of range (partition_count = {count})")]
    BadPartition { index: u32, count: u32 },

    #[error("lock state file is corrupt: {0}")]
    Corrupt(String),

    #[error("lock not held by this process")]
    NotOwned,
}

pub type LockResult<T> = Result<T, LockError>;
