use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory node {0} is already split")]
    AlreadySplit(u32),

    #[error("max shift {0} reached; cannot split further")]
    MaxShiftReached(u8),

    #[error("node {0} has no associated data page (not a leaf)")]
    NotALeaf(u32),

    #[error("corrupt directory image: {0}")]
    Corrupt(String),

    #[error("directory size limit reached: {0} pages")]
    LimitReached(u32),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;
