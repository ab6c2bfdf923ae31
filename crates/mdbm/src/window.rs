//! Windowed access: a fixed-size virtual range reserved once and carved
//! into page-sized slots, used when the database is larger than the
//! process is willing to address at once.
//!
//! The whole range is reserved with one `PROT_NONE` anonymous mapping;
//! individual slots are then populated on demand with `MAP_FIXED` remaps
//! of the backing file, the same trick `remap_file_pages` used to serve
//! before its deprecation. Eviction is plain LRU over the slot table.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use crate::error::{MdbmError, MdbmResult};

/// `window_size` must be at least 2 pages and a multiple of the system
/// page size.
pub fn validate_window_size(window_size: u32, page_size: u32) -> MdbmResult<()> {
    if (window_size as u64) < 2 * page_size as u64 {
        return Err(MdbmError::Invalid(format!(
            "window_size {window_size} must be at least 2 * page_size ({page_size})"
        )));
    }
    let system_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;
    if system_page_size > 0 && window_size % system_page_size != 0 {
        return Err(MdbmError::Invalid(format!(
            "window_size {window_size} must be a multiple of the system page size ({system_page_size})"
        )));
    }
    Ok(())
}

struct Slot {
    file_page: Option<u32>,
}

/// A reserved virtual range, remapped slot-by-slot onto file pages on
/// demand. Read/write, but page-locking is forbidden under this mode —
/// `lock_pages` is modeled simply by callers never exposing one.
pub struct WindowTable {
    arena: NonNull<u8>,
    page_size: u32,
    slot_count: usize,
    slots: Vec<Slot>,
    /// Slot indices ordered least-recently-used first.
    lru: VecDeque<usize>,
}

unsafe impl Send for WindowTable {}
unsafe impl Sync for WindowTable {}

impl WindowTable {
    pub fn new(page_size: u32, window_size: u32) -> MdbmResult<Self> {
        validate_window_size(window_size, page_size)?;
        let slot_count = (window_size / page_size) as usize;

        let arena = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                window_size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if arena == libc::MAP_FAILED {
            return Err(MdbmError::IoError(std::io::Error::last_os_error()));
        }

        Ok(WindowTable {
            arena: NonNull::new(arena as *mut u8).expect("mmap returned null without MAP_FAILED"),
            page_size,
            slot_count,
            slots: (0..slot_count).map(|_| Slot { file_page: None }).collect(),
            lru: (0..slot_count).collect(),
        })
    }

    fn touch(&mut self, slot: usize) {
        self.lru.retain(|&s| s != slot);
        self.lru.push_back(slot);
    }

    fn slot_for(&self, file_page: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.file_page == Some(file_page))
    }

    fn slot_addr(&self, slot: usize) -> *mut libc::c_void {
        unsafe { self.arena.as_ptr().add(slot * self.page_size as usize) as *mut libc::c_void }
    }

    fn remap_slot(&mut self, slot: usize, file: &File, file_page: u32) -> MdbmResult<()> {
        let addr = self.slot_addr(slot);
        let offset = file_page as i64 * self.page_size as i64;
        let ptr = unsafe {
            libc::mmap(
                addr,
                self.page_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MdbmError::IoError(std::io::Error::last_os_error()));
        }
        self.slots[slot].file_page = Some(file_page);
        Ok(())
    }

    /// Resolve `file_page` to a live slot, remapping the LRU slot if it
    /// isn't already resident. Returns `(slot_index, was_already_mapped)`
    /// for the caller's GETPAGE/GETPAGE_UNCACHED counters.
    pub fn resolve(&mut self, file: &File, file_page: u32) -> MdbmResult<(usize, bool)> {
        if let Some(slot) = self.slot_for(file_page) {
            self.touch(slot);
            return Ok((slot, true));
        }
        let victim = *self.lru.front().expect("slot_count is always > 0");
        self.remap_slot(victim, file, file_page)?;
        self.touch(victim);
        tracing::debug!(file_page, slot = victim, "window slot remapped on miss");
        Ok((victim, false))
    }

    pub fn slot_ptr(&self, slot: usize) -> *mut u8 {
        unsafe { self.arena.as_ptr().add(slot * self.page_size as usize) }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

impl Drop for WindowTable {
    fn drop(&mut self) {
        let window_size = self.slot_count * self.page_size as usize;
        unsafe {
            libc::munmap(self.arena.as_ptr() as *mut libc::c_void, window_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn window_size_must_be_at_least_two_pages() {
        assert!(validate_window_size(4096, 4096).is_err());
        assert!(validate_window_size(8192, 4096).is_ok());
    }

    #[test]
    fn resolve_remaps_on_miss_and_hits_on_repeat() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096 * 4]).unwrap();
        tmp.flush().unwrap();
        let file = tmp.reopen().unwrap();

        let mut table = WindowTable::new(4096, 4096 * 2).unwrap();
        let (slot_a, hit_a) = table.resolve(&file, 0).unwrap();
        assert!(!hit_a);
        let (slot_a_again, hit_a_again) = table.resolve(&file, 0).unwrap();
        assert_eq!(slot_a, slot_a_again);
        assert!(hit_a_again);

        // A third distinct page forces an eviction since slot_count == 2.
        table.resolve(&file, 1).unwrap();
        let (_, hit_c) = table.resolve(&file, 2).unwrap();
        assert!(!hit_c);
    }
}
