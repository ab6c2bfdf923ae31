//! A thin, `libc`-based memory mapping. `FileStore` owns one of these for
//! the life of the handle; every byte slice handed out of the storage
//! layer borrows from it, so the compiler enforces the "never outlive the
//! mapping" discipline that raw-pointer code would otherwise need
//! programmer discipline for.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use crate::error::{StorageError, StorageResult};

pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is `MAP_SHARED`; concurrent access across processes is
// coordinated by the lock manager, not by this type. Within a process we
// only ever hand out borrows tied to `&self`/`&mut self`, so Rust's own
// aliasing rules apply on top of that discipline.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map the first `len` bytes of `file` read/write, shared across
    /// processes. `len` must not exceed the file's current size.
    pub fn new(file: &File, len: usize) -> StorageResult<Self> {
        assert!(len > 0, "cannot create a zero-length mapping");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(StorageError::Mmap(std::io::Error::last_os_error().to_string()));
        }
        Ok(Mapping {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null without MAP_FAILED"),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Flush dirty pages to disk; blocks until complete, like `fsync`
    /// blocking until all pages are flushed.
    pub fn flush(&self) -> StorageResult<()> {
        let result = unsafe {
            libc::msync(self.ptr.as_ptr() as *mut libc::c_void, self.len, libc::MS_SYNC)
        };
        if result != 0 {
            return Err(StorageError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
