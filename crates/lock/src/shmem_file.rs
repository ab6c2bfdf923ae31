//! The generic shared-memory-file primitive the lock manager is built on.
//! This is a faithful, minimal implementation of that one contract, not a
//! general-purpose mmap wrapper.
//!
//! The lock state file is named deterministically from the database
//! path: `<db path>.lock`.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::{LockError, LockResult};

/// A tiny home-grown bitflags so this crate doesn't need to pull in the
/// `bitflags` crate for eight constants.
macro_rules! bitflags_like {
    ($(#[$meta:meta])* pub struct $name:ident: $repr:ty { $(const $variant:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($repr);
        impl $name {
            $(pub const $variant: $name = $name($value);)*
            pub const fn empty() -> Self { $name(0) }
            pub const fn bits(self) -> $repr { self.0 }
            pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
        }
        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_like! {
    pub struct OpenFlags: u32 {
        const RDONLY = 0x01;
        const RDWR = 0x02;
        const CREATE = 0x04;
        const TRUNC = 0x08;
        const PRIVATE = 0x10;
        const SYNC = 0x20;
        const GUARD = 0x40;
        const UNLINK = 0x80;
    }
}

pub struct ShmemFile {
    path: PathBuf,
    file: File,
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is shared across processes by construction; access ordering
// is the lock manager's job, not this type's.
unsafe impl Send for ShmemFile {}
unsafe impl Sync for ShmemFile {}

impl ShmemFile {
    /// Open (creating if requested) the shared-memory file backing a
    /// lock region, mapping `initial_size` bytes. `should_init` is set to
    /// `true` if this call is the one that created the file (and is thus
    /// responsible for laying out its initial contents under its own
    /// exclusive lock before any other opener proceeds), `false` if an
    /// existing, already-initialized file was opened.
    pub fn open(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        initial_size: usize,
        should_init: &mut bool,
    ) -> LockResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = OpenOptions::new();
        opts.read(true);
        if flags.contains(OpenFlags::RDWR) {
            opts.write(true);
        }
        if flags.contains(OpenFlags::CREATE) {
            opts.create(true);
        }
        if flags.contains(OpenFlags::TRUNC) {
            opts.truncate(true);
        }

        let existed_before = path.exists();
        let file = opts.open(&path)?;
        let file_len = file.metadata()?.len();
        *should_init = !existed_before || file_len == 0;
        if file_len < initial_size as u64 {
            file.set_len(initial_size as u64)?;
        }

        let map_flags = if flags.contains(OpenFlags::PRIVATE) {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };
        let prot = if flags.contains(OpenFlags::RDONLY) {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let ptr = unsafe {
            libc::mmap(std::ptr::null_mut(), initial_size, prot, map_flags, file.as_raw_fd(), 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(LockError::Io(std::io::Error::last_os_error()));
        }

        tracing::debug!(path = %path.display(), initial_size, should_init = *should_init, "shmem file opened");
        Ok(ShmemFile {
            path,
            file,
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null without MAP_FAILED"),
            len: initial_size,
        })
    }

    /// Mark initialization complete; the initializing process calls this
    /// once its exclusive lock has established the file's initial
    /// contents, after which other openers may downgrade to a shared
    /// lock and proceed.
    pub fn init_complete(&self) {
        tracing::trace!(path = %self.path.display(), "shmem file init complete");
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.file.as_raw_fd()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn close(self, flags: OpenFlags) -> LockResult<()> {
        let path = self.path.clone();
        drop(self);
        if flags.contains(OpenFlags::UNLINK) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::Io(e)),
            }
        }
        Ok(())
    }
}

impl Drop for ShmemFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Deterministic lock-file path for a given database path.
pub fn lock_path_for(db_path: impl AsRef<Path>) -> PathBuf {
    let mut path = db_path.as_ref().as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_opener_sees_should_init_true() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let mut should_init = false;
        let shmem = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE, 64, &mut should_init).unwrap();
        assert!(should_init);
        shmem.init_complete();
    }

    #[test]
    fn second_opener_sees_should_init_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let mut should_init = false;
        let first = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE, 64, &mut should_init).unwrap();
        first.init_complete();

        let mut should_init2 = false;
        let _second = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE, 64, &mut should_init2).unwrap();
        assert!(!should_init2);
    }

    #[test]
    fn close_with_unlink_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let mut should_init = false;
        let shmem = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE, 64, &mut should_init).unwrap();
        shmem.close(OpenFlags::UNLINK).unwrap();
        assert!(!path.exists());
    }
}
