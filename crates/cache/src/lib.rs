//! Cache-mode eviction and the backing-store plug-in interface:
//! LRU/LFU/GDSF victim selection, the legacy shake and clean_func
//! callbacks, and a file-backed `BackingStore` provider.

mod backing_store;
mod error;
mod policy;
mod shake;

pub use backing_store::{BackingStore, FileBackingStore};
pub use error::{CacheError, CacheResult};
pub use policy::{pick_victim, CacheMode, EntryMeta, EVICT_CLEAN_FIRST_BIT};
pub use shake::{clean_all, clean_page, CleanDecision, CleanFunc, ShakeFunc, ShakeRequest};
