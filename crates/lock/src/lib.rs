//! Cross-process lock manager: exclusive / partitioned / shared named
//! locks over a per-database shared-memory state file, plus the generic
//! shared-memory-file primitive they're built on.

mod error;
mod manager;
mod shmem_file;
mod state;

pub use error::{LockError, LockResult};
pub use manager::{LockIntent, LockManager, LockMode};
pub use shmem_file::{lock_path_for, OpenFlags, ShmemFile};
