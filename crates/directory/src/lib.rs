//! Extendible-hash directory: the tri-state split bitmap that maps a key's
//! hash to the data chunk that owns it.

mod directory;
mod error;

pub use directory::{Directory, NodeIndex};
pub use error::{DirectoryError, DirectoryResult};
