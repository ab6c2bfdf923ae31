//! The lock manager: exclusive, partitioned and shared (MROW) named
//! locks over a per-database shared-memory state file, nestable within a
//! single process via depth counters.
//!
//! Whole-database exclusive/shared locking is `flock(2)` on the state
//! file's descriptor; partitioned locking is `fcntl(2)` byte-range
//! locking, one byte per partition, so independent partitions never
//! contend with each other at the OS level.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;

use mdbm_hash::{hash_of, partition_of, HashId};

use crate::error::{LockError, LockResult};
use crate::shmem_file::{lock_path_for, OpenFlags, ShmemFile};
use crate::state::{LockSlot, LockState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `OPEN_NOLOCK`: every call below is a no-op returning success.
    None,
    Exclusive,
    Partitioned,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockIntent {
    Read,
    Write,
}

pub struct LockManager {
    shmem: Option<ShmemFile>,
    mode: LockMode,
    partition_count: u32,
    hash_id: HashId,
    depth: u32,
    partition_depth: HashMap<u32, u32>,
}

impl LockManager {
    pub fn open(db_path: impl AsRef<Path>, mode: LockMode, partition_count: u32) -> LockResult<Self> {
        if mode == LockMode::None {
            return Ok(LockManager {
                shmem: None,
                mode,
                partition_count: 0,
                hash_id: mdbm_hash::DEFAULT_HASH_ID,
                depth: 0,
                partition_depth: HashMap::new(),
            });
        }

        let partition_count = if mode == LockMode::Partitioned { partition_count.max(1) } else { 1 };
        let path = lock_path_for(db_path.as_ref());
        let size = LockState::required_size(partition_count);
        let mut should_init = false;
        let mut shmem = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE, size, &mut should_init)?;
        if should_init {
            LockState::format(shmem.as_mut_slice(), partition_count);
            shmem.init_complete();
        }

        Ok(LockManager {
            shmem: Some(shmem),
            mode,
            partition_count,
            hash_id: mdbm_hash::DEFAULT_HASH_ID,
            depth: 0,
            partition_depth: HashMap::new(),
        })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    fn fd(&self) -> RawFd {
        self.shmem.as_ref().expect("no lock fd in OPEN_NOLOCK mode").fd()
    }

    fn state(&mut self) -> LockState<'_> {
        LockState::open(self.shmem.as_mut().expect("no lock state in OPEN_NOLOCK mode").as_mut_slice())
    }

    // ---- exclusive --------------------------------------------------

    pub fn lock(&mut self) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        if self.depth == 0 {
            flock_blocking(self.fd(), libc::LOCK_EX)?;
            let pid = std::process::id();
            self.state().set_exclusive(LockSlot { holder_pid: pid, depth: 1 });
            tracing::trace!(pid, "exclusive lock acquired");
        }
        self.depth += 1;
        Ok(())
    }

    pub fn try_lock(&mut self) -> LockResult<bool> {
        if self.mode == LockMode::None {
            return Ok(true);
        }
        if self.depth == 0 {
            if !flock_nonblocking(self.fd(), libc::LOCK_EX)? {
                return Ok(false);
            }
            let pid = std::process::id();
            self.state().set_exclusive(LockSlot { holder_pid: pid, depth: 1 });
        }
        self.depth += 1;
        Ok(true)
    }

    pub fn unlock(&mut self) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        if self.depth == 0 {
            return Err(LockError::NotOwned);
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.state().set_exclusive(LockSlot::default());
            flock_unlock(self.fd())?;
            tracing::trace!("exclusive lock released");
        }
        Ok(())
    }

    // ---- partitioned --------------------------------------------------

    fn partition_of_key(&self, key: &[u8]) -> LockResult<u32> {
        if self.partition_count == 0 {
            return Err(LockError::BadPartition { index: 0, count: 0 });
        }
        Ok(partition_of(hash_of(key, self.hash_id), self.partition_count as usize) as u32)
    }

    pub fn plock(&mut self, key: &[u8]) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        let idx = self.partition_of_key(key)?;
        let depth = self.partition_depth.entry(idx).or_insert(0);
        if *depth == 0 {
            fcntl_lock(self.fd(), idx as i64, true)?;
            let pid = std::process::id();
            self.state().set_partition(idx, LockSlot { holder_pid: pid, depth: 1 });
        }
        *self.partition_depth.entry(idx).or_insert(0) += 1;
        Ok(())
    }

    pub fn try_plock(&mut self, key: &[u8]) -> LockResult<bool> {
        if self.mode == LockMode::None {
            return Ok(true);
        }
        let idx = self.partition_of_key(key)?;
        let already = *self.partition_depth.get(&idx).unwrap_or(&0);
        if already == 0 {
            if !fcntl_lock(self.fd(), idx as i64, false)? {
                return Ok(false);
            }
            let pid = std::process::id();
            self.state().set_partition(idx, LockSlot { holder_pid: pid, depth: 1 });
        }
        *self.partition_depth.entry(idx).or_insert(0) += 1;
        Ok(true)
    }

    pub fn punlock(&mut self, key: &[u8]) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        let idx = self.partition_of_key(key)?;
        let depth = self.partition_depth.get_mut(&idx).ok_or(LockError::NotOwned)?;
        if *depth == 0 {
            return Err(LockError::NotOwned);
        }
        *depth -= 1;
        if *depth == 0 {
            self.state().set_partition(idx, LockSlot::default());
            fcntl_unlock(self.fd(), idx as i64)?;
        }
        Ok(())
    }

    // ---- shared (MROW) -------------------------------------------------

    pub fn lock_shared(&mut self) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        flock_blocking(self.fd(), libc::LOCK_SH)?;
        let count = self.state().shared_reader_count();
        self.state().set_shared_reader_count(count + 1);
        Ok(())
    }

    pub fn try_lock_shared(&mut self) -> LockResult<bool> {
        if self.mode == LockMode::None {
            return Ok(true);
        }
        if !flock_nonblocking(self.fd(), libc::LOCK_SH)? {
            return Ok(false);
        }
        let count = self.state().shared_reader_count();
        self.state().set_shared_reader_count(count + 1);
        Ok(true)
    }

    pub fn unlock_shared(&mut self) -> LockResult<()> {
        if self.mode == LockMode::None {
            return Ok(());
        }
        let count = self.state().shared_reader_count();
        self.state().set_shared_reader_count((count - 1).max(0));
        flock_unlock(self.fd())
    }

    // ---- smart dispatch -----------------------------------------

    pub fn lock_smart(&mut self, key: &[u8], intent: LockIntent) -> LockResult<()> {
        match self.mode {
            LockMode::None => Ok(()),
            LockMode::Exclusive => self.lock(),
            LockMode::Partitioned => self.plock(key),
            LockMode::Shared => match intent {
                LockIntent::Write => self.lock(),
                LockIntent::Read => self.lock_shared(),
            },
        }
    }

    pub fn try_lock_smart(&mut self, key: &[u8], intent: LockIntent) -> LockResult<bool> {
        match self.mode {
            LockMode::None => Ok(true),
            LockMode::Exclusive => self.try_lock(),
            LockMode::Partitioned => self.try_plock(key),
            LockMode::Shared => match intent {
                LockIntent::Write => self.try_lock(),
                LockIntent::Read => self.try_lock_shared(),
            },
        }
    }

    pub fn unlock_smart(&mut self, key: &[u8], intent: LockIntent) -> LockResult<()> {
        match self.mode {
            LockMode::None => Ok(()),
            LockMode::Exclusive => self.unlock(),
            LockMode::Partitioned => self.punlock(key),
            LockMode::Shared => match intent {
                LockIntent::Write => self.unlock(),
                LockIntent::Read => self.unlock_shared(),
            },
        }
    }

    // ---- introspection / administration --------------------------------

    pub fn is_locked(&mut self) -> bool {
        if self.mode == LockMode::None {
            return false;
        }
        self.state().exclusive().held()
    }

    pub fn is_owned(&self) -> bool {
        self.mode != LockMode::None && self.depth > 0
    }

    /// Forcibly reinitialize the lock state; unsafe while any process
    /// still holds the lock.
    pub fn lock_reset(db_path: impl AsRef<Path>, partition_count: u32) -> LockResult<()> {
        let path = lock_path_for(db_path.as_ref());
        let size = LockState::required_size(partition_count.max(1));
        let mut should_init = false;
        let mut shmem = ShmemFile::open(&path, OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::TRUNC, size, &mut should_init)?;
        LockState::format(shmem.as_mut_slice(), partition_count.max(1));
        shmem.init_complete();
        Ok(())
    }

    /// Remove the lock shared-memory file; only safe once every user has
    /// closed.
    pub fn delete_lockfiles(db_path: impl AsRef<Path>) -> LockResult<()> {
        let path = lock_path_for(db_path.as_ref());
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }
}

fn flock_blocking(fd: RawFd, op: libc::c_int) -> LockResult<()> {
    loop {
        let r = unsafe { libc::flock(fd, op) };
        if r == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(LockError::Io(err));
    }
}

fn flock_nonblocking(fd: RawFd, op: libc::c_int) -> LockResult<bool> {
    loop {
        let r = unsafe { libc::flock(fd, op | libc::LOCK_NB) };
        if r == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        return Err(LockError::Io(err));
    }
}

fn flock_unlock(fd: RawFd) -> LockResult<()> {
    flock_blocking(fd, libc::LOCK_UN)
}

fn fcntl_lock(fd: RawFd, start: i64, blocking: bool) -> LockResult<bool> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = 1;

    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        let r = unsafe { libc::fcntl(fd, cmd, &fl) };
        if r == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        if !blocking
            && (err.raw_os_error() == Some(libc::EACCES) || err.raw_os_error() == Some(libc::EAGAIN))
        {
            return Ok(false);
        }
        return Err(LockError::Io(err));
    }
}

fn fcntl_unlock(fd: RawFd, start: i64) -> LockResult<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_UNLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = 1;

    let r = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if r != 0 {
        return Err(LockError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_lock_nests_and_reports_ownership() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        let mut mgr = LockManager::open(&db_path, LockMode::Exclusive, 0).unwrap();

        assert!(!mgr.is_owned());
        mgr.lock().unwrap();
        mgr.lock().unwrap();
        assert!(mgr.is_owned());
        assert!(mgr.is_locked());

        mgr.unlock().unwrap();
        assert!(mgr.is_owned());
        mgr.unlock().unwrap();
        assert!(!mgr.is_owned());
        assert!(!mgr.is_locked());
    }

    #[test]
    fn unlock_without_a_matching_lock_errors() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        let mut mgr = LockManager::open(&db_path, LockMode::Exclusive, 0).unwrap();
        assert!(matches!(mgr.unlock(), Err(LockError::NotOwned)));
    }

    #[test]
    fn partitioned_locks_on_different_keys_do_not_contend() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        let mut mgr = LockManager::open(&db_path, LockMode::Partitioned, 16).unwrap();

        mgr.plock(b"a").unwrap();
        mgr.plock(b"totally-different-key").unwrap();
        mgr.punlock(b"totally-different-key").unwrap();
        mgr.punlock(b"a").unwrap();
    }

    #[test]
    fn nolock_mode_is_always_a_no_op() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        let mut mgr = LockManager::open(&db_path, LockMode::None, 0).unwrap();
        mgr.lock().unwrap();
        mgr.unlock().unwrap();
        assert!(!mgr.is_locked());
        assert!(!crate::shmem_file::lock_path_for(&db_path).exists());
    }

    #[test]
    fn lock_reset_reinitializes_the_state_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        {
            let mut mgr = LockManager::open(&db_path, LockMode::Exclusive, 0).unwrap();
            mgr.lock().unwrap();
            mgr.unlock().unwrap();
        }
        LockManager::lock_reset(&db_path, 0).unwrap();
        let mut mgr = LockManager::open(&db_path, LockMode::Exclusive, 0).unwrap();
        assert!(!mgr.is_locked());
    }

    #[test]
    fn delete_lockfiles_removes_the_state_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.mdbm");
        {
            let _mgr = LockManager::open(&db_path, LockMode::Exclusive, 0).unwrap();
        }
        LockManager::delete_lockfiles(&db_path).unwrap();
        assert!(!crate::shmem_file::lock_path_for(&db_path).exists());
    }
}
