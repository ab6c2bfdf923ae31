//! MDBM: a memory-mapped, on-disk, hashed key-value store with
//! extendible-hash directory growth, optional large-object overflow
//! storage, multi-process locking, and cache-mode eviction against a
//! backing-store plug-in.
//!
//! This crate holds the public `Mdbm` handle, windowed access, integrity
//! checking and stats, and ties together the lower crates in the
//! workspace: `mdbm-hash`, `mdbm-storage`, `mdbm-directory`, `mdbm-lock`
//! and `mdbm-cache`.

pub mod check;
pub mod config;
pub mod error;
pub mod flags;
mod handle;
pub mod logging;
pub mod stats;
pub mod window;

pub use config::{LockModeConfig, MdbmConfig};
pub use error::{MdbmError, MdbmResult, StoreOutcome};
pub use flags::{FetchIntent, OpenFlags, StoreFlags, StoreMode};
pub use handle::{Mdbm, MdbmEntries, MdbmIter, NestedMdbmBackingStore, Reserved, ReserveOutcome};

pub use mdbm_cache::{BackingStore, CacheMode, CleanDecision, CleanFunc, FileBackingStore};
pub use mdbm_hash::HashId;
pub use mdbm_lock::{LockManager, LockMode};
