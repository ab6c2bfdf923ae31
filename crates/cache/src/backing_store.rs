//! The backing-store plug-in: a capability set `{init, term, lock,
//! unlock, fetch, store, delete, dup}` a cache-mode handle writes through
//! to on a miss or a non-`CACHE_ONLY` store.
//!
//! Only the FILE provider lives here. The MDBM-nested provider ("another
//! MDBM handle; the cache handle then owns and closes the nested
//! handle") is implemented in the `mdbm` crate instead, since it needs
//! the full handle type and this crate sits below it in the dependency
//! graph.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mdbm_hash::{hash_of, HashId};

use crate::error::{CacheError, CacheResult};

/// `init/term/lock/unlock/fetch/store/delete/dup`.
pub trait BackingStore {
    fn init(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn term(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn lock(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn unlock(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn fetch(&mut self, key: &[u8]) -> CacheResult<Option<Vec<u8>>>;

    fn store(&mut self, key: &[u8], value: &[u8]) -> CacheResult<()>;

    fn delete(&mut self, key: &[u8]) -> CacheResult<()>;

    /// Produce an independent handle onto the same backing store, for a
    /// duplicated cache handle.
    fn dup(&self) -> CacheResult<Box<dyn BackingStore>>;
}

const SLOT_HEADER_SIZE: usize = 1 + 4 + 4; // occupied flag, key_len, value_len

/// A side file of fixed-size open-addressed slots, intended as a reference
/// implementation rather than a production key-value store. Collisions
/// probe linearly; an entry that doesn't fit in one slot is rejected.
pub struct FileBackingStore {
    path: PathBuf,
    file: File,
    slot_size: usize,
    slot_count: usize,
}

impl FileBackingStore {
    pub fn open(path: impl AsRef<Path>, slot_size: usize, slot_count: usize) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let needed_len = (slot_size * slot_count) as u64;
        if file.metadata()?.len() < needed_len {
            file.set_len(needed_len)?;
        }
        Ok(FileBackingStore { path, file, slot_size, slot_count })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn probe_sequence(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let start = hash_of(key, HashId::Fnv) as usize % self.slot_count;
        (0..self.slot_count).map(move |i| (start + i) % self.slot_count)
    }

    /// `Empty` means the slot was never occupied (a probe may stop here);
    /// `Tombstone` means a deletion left it vacant, but a probe must keep
    /// going since a later key may have collided past it.
    fn read_slot(&mut self, slot: usize) -> CacheResult<SlotState> {
        let mut buf = vec![0u8; self.slot_size];
        self.file.seek(SeekFrom::Start((slot * self.slot_size) as u64))?;
        self.file.read_exact(&mut buf)?;
        match buf[0] {
            0 => Ok(SlotState::Empty),
            2 => Ok(SlotState::Tombstone),
            _ => {
                let key_len = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
                let value_len = u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize;
                let key = buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + key_len].to_vec();
                let value = buf[SLOT_HEADER_SIZE + key_len..SLOT_HEADER_SIZE + key_len + value_len].to_vec();
                Ok(SlotState::Occupied(key, value))
            }
        }
    }

    fn write_slot(&mut self, slot: usize, key: &[u8], value: &[u8]) -> CacheResult<()> {
        if SLOT_HEADER_SIZE + key.len() + value.len() > self.slot_size {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "key/value too large for the backing store's slot size",
            )));
        }
        let mut buf = vec![0u8; self.slot_size];
        buf[0] = 1;
        buf[1..5].copy_from_slice(&(key.len() as u32).to_le_bytes());
        buf[5..9].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + key.len()].copy_from_slice(key);
        buf[SLOT_HEADER_SIZE + key.len()..SLOT_HEADER_SIZE + key.len() + value.len()].copy_from_slice(value);
        self.file.seek(SeekFrom::Start((slot * self.slot_size) as u64))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn clear_slot(&mut self, slot: usize) -> CacheResult<()> {
        let mut buf = vec![0u8; self.slot_size];
        buf[0] = 2; // tombstone, not empty: later probes must not stop here
        self.file.seek(SeekFrom::Start((slot * self.slot_size) as u64))?;
        self.file.write_all(&buf)?;
        Ok(())
    }
}

enum SlotState {
    Empty,
    Tombstone,
    Occupied(Vec<u8>, Vec<u8>),
}

impl BackingStore for FileBackingStore {
    fn fetch(&mut self, key: &[u8]) -> CacheResult<Option<Vec<u8>>> {
        for slot in self.probe_sequence(key).collect::<Vec<_>>() {
            match self.read_slot(slot)? {
                SlotState::Empty => return Ok(None),
                SlotState::Tombstone => continue,
                SlotState::Occupied(k, v) if k == key => return Ok(Some(v)),
                SlotState::Occupied(..) => continue,
            }
        }
        Ok(None)
    }

    fn store(&mut self, key: &[u8], value: &[u8]) -> CacheResult<()> {
        let mut first_reusable: Option<usize> = None;
        for slot in self.probe_sequence(key).collect::<Vec<_>>() {
            match self.read_slot(slot)? {
                SlotState::Empty => {
                    let target = first_reusable.unwrap_or(slot);
                    return self.write_slot(target, key, value);
                }
                SlotState::Tombstone => {
                    if first_reusable.is_none() {
                        first_reusable = Some(slot);
                    }
                }
                SlotState::Occupied(k, _) if k == key => return self.write_slot(slot, key, value),
                SlotState::Occupied(..) => continue,
            }
        }
        if let Some(slot) = first_reusable {
            return self.write_slot(slot, key, value);
        }
        Err(CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "backing store is full",
        )))
    }

    fn delete(&mut self, key: &[u8]) -> CacheResult<()> {
        for slot in self.probe_sequence(key).collect::<Vec<_>>() {
            match self.read_slot(slot)? {
                SlotState::Empty => return Ok(()),
                SlotState::Tombstone => continue,
                SlotState::Occupied(k, _) if k == key => return self.clear_slot(slot),
                SlotState::Occupied(..) => continue,
            }
        }
        Ok(())
    }

    fn dup(&self) -> CacheResult<Box<dyn BackingStore>> {
        Ok(Box::new(FileBackingStore::open(&self.path, self.slot_size, self.slot_count)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_fetch_round_trips() {
        let dir = tempdir().unwrap();
        let mut store = FileBackingStore::open(dir.path().join("backing"), 64, 16).unwrap();
        store.store(b"k1", b"v1").unwrap();
        assert_eq!(store.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.fetch(b"missing").unwrap(), None);
    }

    #[test]
    fn delete_clears_the_slot() {
        let dir = tempdir().unwrap();
        let mut store = FileBackingStore::open(dir.path().join("backing"), 64, 16).unwrap();
        store.store(b"k1", b"v1").unwrap();
        store.delete(b"k1").unwrap();
        assert_eq!(store.fetch(b"k1").unwrap(), None);
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let mut store = FileBackingStore::open(dir.path().join("backing"), 16, 4).unwrap();
        assert!(store.store(b"k1", &[0u8; 64]).is_err());
    }

    #[test]
    fn delete_leaves_a_tombstone_so_a_later_collision_is_still_found() {
        let dir = tempdir().unwrap();
        let slot_count = 2;
        let mut store = FileBackingStore::open(dir.path().join("backing"), 64, slot_count).unwrap();

        // Find two keys whose probe sequence starts at the same slot, so the
        // second key is known to have been pushed past the first by linear
        // probing.
        let mut first: Option<Vec<u8>> = None;
        let mut second: Option<Vec<u8>> = None;
        for i in 0..1000u32 {
            let key = format!("k{i}").into_bytes();
            let start = hash_of(&key, HashId::Fnv) as usize % slot_count;
            if start != 0 {
                continue;
            }
            match first {
                None => first = Some(key),
                Some(_) => {
                    second = Some(key);
                    break;
                }
            }
        }
        let (first, second) = (first.unwrap(), second.unwrap());

        store.store(&first, b"v1").unwrap();
        store.store(&second, b"v2").unwrap();
        store.delete(&first).unwrap();

        assert_eq!(store.fetch(&second).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn dup_produces_an_independent_handle_onto_the_same_file() {
        let dir = tempdir().unwrap();
        let mut store = FileBackingStore::open(dir.path().join("backing"), 64, 16).unwrap();
        store.store(b"k1", b"v1").unwrap();
        let mut dup = store.dup().unwrap();
        assert_eq!(dup.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }
}
