//! `FileStore` ties the file descriptor, its memory mapping, the file
//! header (page 0) and the chunk manager together into the one object that
//! owns the database's on-disk state for the life of an open handle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkHeader, ChunkType};
use crate::chunk_manager::{ChunkManager, ChunkStorage};
use crate::error::{StorageError, StorageResult};
use crate::header::{DirLocation, FileHeader, HEADER_SIZE};
use crate::mmap::Mapping;

pub struct FileStore {
    path: PathBuf,
    file: File,
    mapping: Mapping,
    page_size: u32,
    read_only: bool,
    chunk_manager: ChunkManager,
}

pub struct CreateOptions {
    pub page_size: u32,
    pub alignment: u8,
    pub hash_id: u8,
    pub dir_min_shift: u8,
    pub dir_max_shift: u8,
    pub cache_mode: u8,
    pub evict_clean_first: bool,
    pub large_objects_enabled: bool,
    pub spill_size: u32,
    pub limit_pages: u32,
    pub partition_count: u32,
    pub stats_enabled: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            page_size: 4096,
            alignment: 8,
            hash_id: 5, // mdbm_hash::HashId::Fnv
            dir_min_shift: 0,
            dir_max_shift: 20,
            cache_mode: 0,
            evict_clean_first: false,
            large_objects_enabled: true,
            spill_size: 3072,
            limit_pages: 0,
            partition_count: 0,
            stats_enabled: true,
        }
    }
}

impl FileStore {
    /// Open an existing database file.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(StorageError::Corrupt {
                what: "file store",
                reason: "file shorter than the header".into(),
            });
        }

        // Map just page 0 first to learn the page size, then remap fully.
        let probe = Mapping::new(&file, HEADER_SIZE.max(1))?;
        let header = FileHeader::decode(probe.as_slice())?;
        drop(probe);

        let page_size = header.page_size as u64;
        let mapped_len = (file_len / page_size) * page_size;
        let mapping = Mapping::new(&file, mapped_len as usize)?;

        let mut store = FileStore {
            path,
            file,
            mapping,
            page_size: header.page_size,
            read_only,
            chunk_manager: ChunkManager::rebuild(&DummyStorage)?,
        };
        store.chunk_manager = ChunkManager::rebuild(&store)?;
        Ok(store)
    }

    /// Create a brand-new database file, truncating any existing content.
    pub fn create(path: impl AsRef<Path>, options: CreateOptions) -> StorageResult<Self> {
        FileHeader::validate_page_size(options.page_size)?;
        FileHeader::validate_alignment(options.alignment)?;
        if options.spill_size >= options.page_size {
            return Err(StorageError::Corrupt {
                what: "create options",
                reason: "spill_size must be < page_size".into(),
            });
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(options.page_size as u64)?;

        let mapping = Mapping::new(&file, options.page_size as usize)?;
        let mut store = FileStore {
            path,
            file,
            mapping,
            page_size: options.page_size,
            read_only: false,
            chunk_manager: ChunkManager::rebuild(&DummyStorage)?,
        };

        let header = FileHeader {
            page_size: options.page_size,
            alignment: options.alignment,
            hash_id: options.hash_id,
            dir_min_shift: options.dir_min_shift,
            dir_max_shift: options.dir_max_shift,
            cache_mode: options.cache_mode,
            evict_clean_first: options.evict_clean_first,
            large_objects_enabled: options.large_objects_enabled,
            spill_size: options.spill_size,
            limit_pages: options.limit_pages,
            partition_count: options.partition_count,
            file_size_hwm_pages: 1,
            dir_location: DirLocation::Inline([0; 8]),
            stats_enabled: options.stats_enabled,
        };
        header.encode(store.mapping.as_mut_slice());
        store.chunk_manager = ChunkManager::rebuild(&store)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn header(&self) -> FileHeader {
        FileHeader::decode(self.page_slice(0, 1)).expect("header validated on open/create")
    }

    pub fn set_header(&mut self, header: &FileHeader) {
        header.encode(self.page_slice_mut(0, 1));
    }

    pub fn chunk_manager_mut(&mut self) -> &mut ChunkManager {
        &mut self.chunk_manager
    }

    /// Allocate a new chunk of `pages` pages. A thin, borrow-checker
    /// friendly wrapper around `ChunkManager::alloc` that reads the limit
    /// out of the header so callers don't have to.
    pub fn alloc_chunk(
        &mut self,
        pages: u32,
        chunk_type: ChunkType,
        owner_dir_page: u32,
    ) -> StorageResult<u32> {
        let limit_pages = self.header().limit_pages;
        let mut manager = std::mem::replace(&mut self.chunk_manager, ChunkManager::rebuild(&DummyStorage)?);
        let result = manager.alloc(self, pages, chunk_type, owner_dir_page, limit_pages);
        self.chunk_manager = manager;
        result
    }

    pub fn free_chunk(&mut self, page: u32) -> StorageResult<()> {
        let mut manager = std::mem::replace(&mut self.chunk_manager, ChunkManager::rebuild(&DummyStorage)?);
        let result = manager.free(self, page);
        self.chunk_manager = manager;
        result
    }

    pub fn chunk_header(&self, page: u32) -> StorageResult<ChunkHeader> {
        ChunkHeader::decode(self.page_slice(page, 1))
    }

    /// Spill `value` into a freshly allocated LOB chunk; same
    /// borrow-checker-friendly wrapper as `alloc_chunk`.
    pub fn lob_put(&mut self, value: &[u8], owner_dir_page: u32) -> StorageResult<u32> {
        let limit_pages = self.header().limit_pages;
        let mut manager = std::mem::replace(&mut self.chunk_manager, ChunkManager::rebuild(&DummyStorage)?);
        let result = crate::lob::lob_put(self, &mut manager, value, owner_dir_page, limit_pages);
        self.chunk_manager = manager;
        result
    }

    pub fn lob_get(&self, first_page: u32) -> StorageResult<&[u8]> {
        crate::lob::lob_get(self, first_page)
    }

    pub fn lob_free(&mut self, first_page: u32) -> StorageResult<()> {
        let mut manager = std::mem::replace(&mut self.chunk_manager, ChunkManager::rebuild(&DummyStorage)?);
        let result = crate::lob::lob_free(self, &mut manager, first_page);
        self.chunk_manager = manager;
        result
    }

    /// Whether `new_value_len` bytes still fit in the LOB chunk starting
    /// at `first_page` without reallocating.
    pub fn lob_fits_in_place(&self, first_page: u32, new_value_len: usize) -> StorageResult<bool> {
        crate::lob::lob_fits_in_place(self, first_page, new_value_len)
    }

    /// Overwrite an existing LOB chunk's value in place. Caller must have
    /// already checked `lob_fits_in_place`.
    pub fn lob_put_in_place(&mut self, first_page: u32, value: &[u8]) -> StorageResult<()> {
        crate::lob::lob_put_in_place(self, first_page, value)
    }

    pub fn for_each_chunk(&self, visit: impl FnMut(u32, &ChunkHeader)) -> StorageResult<()> {
        ChunkManager::for_each_chunk(self, visit)
    }

    /// `msync` + `fsync`: flush the mapping and the file metadata. Blocks
    /// until complete.
    pub fn sync(&self) -> StorageResult<()> {
        tracing::trace!(path = %self.path.display(), "sync");
        self.mapping.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl ChunkStorage for FileStore {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.mapping.len() as u32 / self.page_size
    }

    fn page_slice_mut(&mut self, first_page: u32, length_pages: u32) -> &mut [u8] {
        let start = first_page as usize * self.page_size as usize;
        let end = start + length_pages as usize * self.page_size as usize;
        &mut self.mapping.as_mut_slice()[start..end]
    }

    fn page_slice(&self, first_page: u32, length_pages: u32) -> &[u8] {
        let start = first_page as usize * self.page_size as usize;
        let end = start + length_pages as usize * self.page_size as usize;
        &self.mapping.as_slice()[start..end]
    }

    fn grow_to(&mut self, new_page_count: u32) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "cannot grow a read-only database",
            )));
        }
        let new_len = new_page_count as u64 * self.page_size as u64;
        if new_len <= self.mapping.len() as u64 {
            return Ok(());
        }
        tracing::debug!(new_page_count, new_len, "remapping after file growth");
        self.file.set_len(new_len)?;
        self.mapping = Mapping::new(&self.file, new_len as usize)?;

        let mut header = self.header();
        header.file_size_hwm_pages = header.file_size_hwm_pages.max(new_page_count);
        self.set_header(&header);
        Ok(())
    }
}

/// A never-constructed placeholder used only to satisfy `ChunkManager::rebuild`'s
/// signature while `FileStore` itself is still mid-construction. Its
/// methods are unreachable: `FileStore::open`/`create` always replace the
/// manager built from it before returning.
struct DummyStorage;

impl ChunkStorage for DummyStorage {
    fn page_size(&self) -> u32 {
        unreachable!("DummyStorage is never read from")
    }
    fn page_count(&self) -> u32 {
        0
    }
    fn page_slice_mut(&mut self, _first_page: u32, _length_pages: u32) -> &mut [u8] {
        unreachable!("DummyStorage is never read from")
    }
    fn page_slice(&self, _first_page: u32, _length_pages: u32) -> &[u8] {
        unreachable!("DummyStorage is never read from")
    }
    fn grow_to(&mut self, _new_page_count: u32) -> StorageResult<()> {
        unreachable!("DummyStorage is never grown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_round_trips_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbm");

        {
            let store = FileStore::create(&path, CreateOptions::default()).unwrap();
            store.sync().unwrap();
        }

        let reopened = FileStore::open(&path, false).unwrap();
        assert_eq!(reopened.header().page_size, 4096);
    }

    #[test]
    fn alloc_chunk_grows_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbm");
        let mut store = FileStore::create(&path, CreateOptions::default()).unwrap();
        let page_count_before = store.page_count();
        let chunk = store.alloc_chunk(1, ChunkType::Data, 0).unwrap();
        assert!(chunk >= 1);
        assert!(store.page_count() >= page_count_before);
    }

    #[test]
    fn rejects_spill_size_larger_than_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbm");
        let mut opts = CreateOptions::default();
        opts.spill_size = opts.page_size;
        assert!(FileStore::create(&path, opts).is_err());
    }
}
