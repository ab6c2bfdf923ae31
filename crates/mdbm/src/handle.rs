//! `Mdbm`: the public handle tying the directory, file store, lock
//! manager and cache-mode policy together.

use std::path::Path;

use mdbm_cache::{clean_all, clean_page, pick_victim, BackingStore, CacheError, CacheMode, CleanFunc, EntryMeta, ShakeFunc, ShakeRequest};
use mdbm_directory::Directory;
use mdbm_hash::{hash_of, HashId};
use mdbm_lock::{LockIntent, LockManager, LockMode};
use mdbm_storage::{ChunkStorage, ChunkType, CreateOptions, DirLocation, FileHeader, FileStore, PageView, ENTRY_FLAG_CLEAN, ENTRY_FLAG_LARGE_OBJECT};

use crate::config::{LockModeConfig, MdbmConfig};
use crate::error::{MdbmError, MdbmResult, StoreOutcome};
use crate::flags::{OpenFlags, StoreFlags, StoreMode};
use crate::stats::{Counters, TimeSource, StatTimer};
use crate::window::WindowTable;

fn lock_mode_of(config: LockModeConfig) -> LockMode {
    match config {
        LockModeConfig::None => LockMode::None,
        LockModeConfig::Exclusive => LockMode::Exclusive,
        LockModeConfig::Partitioned => LockMode::Partitioned,
        LockModeConfig::Shared => LockMode::Shared,
    }
}

/// The open handle. One `Mdbm` per file per process; concurrent access
/// across processes goes through the lock manager, never through sharing
/// a handle across threads without external synchronization.
pub struct Mdbm {
    store: FileStore,
    directory: Directory,
    lock: Option<LockManager>,
    hash_id: HashId,
    align: u8,
    spill_size: u32,
    large_objects_enabled: bool,
    cache_mode: CacheMode,
    evict_clean_first: bool,
    backing_store: Option<Box<dyn BackingStore>>,
    shake: Option<Box<dyn ShakeFunc>>,
    /// Present when the handle was opened with `OPEN_WINDOWED`: the
    /// bounded virtual-address-space slot table used for databases larger
    /// than the process wants to address at once.
    /// `lock_pages` is refused whenever this is `Some`.
    window: Option<WindowTable>,
    /// GDSF's running inflation floor; advanced by one unit per eviction
    /// on a page so relative victim ordering ages forward across calls,
    /// per the classic Greedy-Dual-Size algorithm.
    gdsf_inflation: f64,
    /// Monotonically increasing logical clock stamped onto `last_access`
    /// on every touch; a counter rather than wall-clock time, since only
    /// relative ordering between entries matters to LRU scoring.
    logical_clock: u64,
    stats: Option<Counters>,
    time_source: TimeSource,
    /// The cursor `firstkey`/`nextkey`/`first`/`next` advance; a plain
    /// `MdbmIter` owned by the handle so callers who don't need a second,
    /// concurrent pass don't have to carry one themselves.
    default_iter: MdbmIter,
}

fn load_directory(store: &FileStore, header: &FileHeader) -> MdbmResult<Directory> {
    match header.dir_location {
        DirLocation::Inline(bytes) => Ok(Directory::deserialize(&bytes)?),
        DirLocation::Chunk { first_page } => {
            let chunk_header = store.chunk_header(first_page)?;
            let region = store.page_slice(first_page, chunk_header.length_pages);
            let body = &region[mdbm_storage::CHUNK_HEADER_SIZE..];
            let len = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
            Ok(Directory::deserialize(&body[4..4 + len])?)
        }
    }
}

impl Mdbm {
    /// Open (or create, with `OpenFlags::CREAT`) a database at `path`.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, config: &MdbmConfig) -> MdbmResult<Self> {
        crate::logging::init();
        let path = path.as_ref();
        let creating = flags.contains(OpenFlags::CREAT) && !path.exists();
        let read_only = !flags.contains(OpenFlags::RDWR);

        let mut store = if creating {
            let options = CreateOptions {
                page_size: config.page_size,
                alignment: config.alignment,
                hash_id: config.hash_id,
                dir_min_shift: config.dir_min_shift,
                dir_max_shift: config.dir_max_shift,
                cache_mode: config.cache_mode,
                evict_clean_first: config.evict_clean_first,
                large_objects_enabled: config.large_objects_enabled,
                spill_size: config.spill_size,
                limit_pages: config.limit_pages,
                partition_count: config.partition_count,
                stats_enabled: config.stats_enabled,
            };
            FileStore::create(path, options)?
        } else {
            FileStore::open(path, read_only)?
        };

        let header = store.header();
        let hash_id = HashId::from_u8(header.hash_id)
            .map_err(|e| MdbmError::Unsupported(format!("unknown hash id {}", e.0)))?;

        let mut directory = if creating {
            let mut dir = Directory::new(header.dir_min_shift, header.dir_max_shift);
            let root_page = store.alloc_chunk(1, ChunkType::Data, 0)?;
            PageView::format(store.page_slice_mut(root_page, 1));
            dir.seed_root(root_page);

            if config.pre_split_pages > 1 {
                let leaves = dir.pre_split(config.pre_split_pages, || {
                    let page = store.alloc_chunk(1, ChunkType::Data, 0).expect("pre_split: page allocation failed on a freshly created, unbounded file");
                    PageView::format(store.page_slice_mut(page, 1));
                    page
                })?;
                if leaves.len() > 1 {
                    // The root leaf was split away; its originally seeded
                    // page is no longer referenced by the directory.
                    store.free_chunk(root_page)?;
                }
            }
            dir
        } else {
            load_directory(&store, &header)?
        };
        if header.limit_pages > 0 {
            directory.limit(header.limit_pages);
        }

        let lock = if flags.contains(OpenFlags::OPEN_NOLOCK) {
            None
        } else {
            let mode = lock_mode_of(config.lock_mode);
            Some(LockManager::open(path, mode, header.partition_count)?)
        };

        let cache_mode = CacheMode::from_u8(header.cache_mode)?;

        let window = if flags.contains(OpenFlags::OPEN_WINDOWED) {
            if config.window_size == 0 {
                return Err(MdbmError::Invalid(
                    "OPEN_WINDOWED requires a non-zero MdbmConfig::window_size".into(),
                ));
            }
            Some(WindowTable::new(header.page_size, config.window_size)?)
        } else {
            None
        };

        let mut handle = Mdbm {
            store,
            directory,
            lock,
            hash_id,
            align: header.alignment,
            spill_size: header.spill_size,
            large_objects_enabled: header.large_objects_enabled,
            cache_mode,
            evict_clean_first: header.evict_clean_first,
            backing_store: None,
            shake: None,
            window,
            gdsf_inflation: 0.0,
            logical_clock: 0,
            stats: if header.stats_enabled { Some(Counters::default()) } else { None },
            time_source: TimeSource::Monotonic,
            default_iter: MdbmIter::new(),
        };

        if creating {
            handle.save_directory()?;
        }
        Ok(handle)
    }

    /// Flush the mapping and file metadata. Consuming `self` mirrors
    /// `mdbm_close`: once closed, there is no handle left to operate on.
    pub fn close(self) -> MdbmResult<()> {
        self.store.sync()?;
        Ok(())
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn stats(&self) -> Option<&Counters> {
        self.stats.as_ref()
    }

    /// Number of slots in the windowed-mode slot table, or `None` when
    /// this handle was not opened with `OPEN_WINDOWED`.
    pub fn window_slot_count(&self) -> Option<usize> {
        self.window.as_ref().map(|w| w.slot_count())
    }

    /// Pin the pages touched by subsequent accesses in memory. Windowed
    /// mode cannot honor this since any access may evict and remap a slot
    /// out from under a previously pinned page.
    pub fn lock_pages(&mut self) -> MdbmResult<()> {
        if self.window.is_some() {
            return Err(MdbmError::Unsupported("lock_pages is not available in windowed mode".into()));
        }
        Ok(())
    }

    /// Attach a backing store for this handle's cache mode. The
    /// handle owns it from here on and closes it along with itself.
    pub fn set_backing_store(&mut self, backing: Box<dyn BackingStore>) {
        self.backing_store = Some(backing);
    }

    /// Register the legacy pre-split `shake` callback: invoked on a full
    /// data page once the directory can no longer split (`shift ==
    /// max_shift`), before cache-mode eviction is tried.
    pub fn set_shake_func(&mut self, shake: Box<dyn ShakeFunc>) {
        self.shake = Some(shake);
    }

    fn save_directory(&mut self) -> MdbmResult<()> {
        let bytes = self.directory.serialize();
        let mut header = self.store.header();
        let old_location = header.dir_location;

        if bytes.len() <= 8 {
            let mut inline = [0u8; 8];
            inline[..bytes.len()].copy_from_slice(&bytes);
            header.dir_location = DirLocation::Inline(inline);
        } else {
            let total_len = 4 + bytes.len();
            let pages = ((total_len as u32 + mdbm_storage::CHUNK_HEADER_SIZE as u32) + header.page_size - 1) / header.page_size;
            let pages = pages.max(1);
            let first_page = self.store.alloc_chunk(pages, ChunkType::Dir, 0)?;
            let region = self.store.page_slice_mut(first_page, pages);
            let body = &mut region[mdbm_storage::CHUNK_HEADER_SIZE..];
            body[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            body[4..4 + bytes.len()].copy_from_slice(&bytes);
            header.dir_location = DirLocation::Chunk { first_page };
        }

        self.store.set_header(&header);
        if let DirLocation::Chunk { first_page } = old_location {
            if header.dir_location != DirLocation::Chunk { first_page } {
                self.store.free_chunk(first_page)?;
            }
        }
        Ok(())
    }

    fn with_lock<T>(&mut self, key: &[u8], intent: LockIntent, body: impl FnOnce(&mut Self) -> MdbmResult<T>) -> MdbmResult<T> {
        if self.lock.is_some() {
            self.lock.as_mut().unwrap().lock_smart(key, intent)?;
        }
        let result = body(self);
        if self.lock.is_some() {
            self.lock.as_mut().unwrap().unlock_smart(key, intent)?;
        }
        result
    }

    // ---- fetch -----------------------------------------------------

    pub fn fetch(&mut self, key: &[u8]) -> MdbmResult<Option<Vec<u8>>> {
        let timer = StatTimer::start(self.time_source);
        let result = self.with_lock(key, LockIntent::Read, |s| s.fetch_locked(key));
        if let Some(stats) = &mut self.stats {
            stats.record_fetch(matches!(result, Ok(Some(_))), timer.elapsed());
        }
        result
    }

    fn fetch_locked(&mut self, key: &[u8]) -> MdbmResult<Option<Vec<u8>>> {
        let hash = hash_of(key, self.hash_id);
        let (_, page, _) = self.directory.page_for_hash(hash)?;
        let found = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            view.lookup(key, hash)
        };
        let Some(idx) = found else {
            return self.fetch_through_backing_store(key, page);
        };
        self.touch_entry(page, idx);
        self.read_entry(page, idx).map(Some)
    }

    /// On a miss, consult the backing store (if any) and, on a hit,
    /// populate the page so the next `fetch` is local.
    fn fetch_through_backing_store(&mut self, key: &[u8], page: u32) -> MdbmResult<Option<Vec<u8>>> {
        let Some(backing) = &mut self.backing_store else {
            return Ok(None);
        };
        let Some(value) = backing.fetch(key)? else {
            return Ok(None);
        };
        let hash = hash_of(key, self.hash_id);
        let needed = PageView::required_space(key.len(), value.len(), self.align);
        let mut view = PageView::open(self.store.page_slice_mut(page, 1))?;
        if view.free_space() >= needed {
            view.insert_raw(key, &value, hash, self.align, 0);
        }
        Ok(Some(value))
    }

    /// Walk all values stored under `key` (INSERT_DUP may have laid down
    /// several). `iter` is seeded to the key's home page on first use; a
    /// caller starting a fresh dup walk must pass a freshly reset
    /// `MdbmIter` — reusing one left positioned partway through a walk of
    /// a *different* key that happens to share the same home page resumes
    /// from the old position rather than restarting. Cross-page
    /// duplicates don't occur: every occurrence of a key hashes to the
    /// same page.
    pub fn fetch_dup(&mut self, key: &[u8], iter: &mut MdbmIter) -> MdbmResult<Option<Vec<u8>>> {
        self.with_lock(key, LockIntent::Read, |s| s.fetch_dup_locked(key, iter))
    }

    fn fetch_dup_locked(&mut self, key: &[u8], iter: &mut MdbmIter) -> MdbmResult<Option<Vec<u8>>> {
        let hash = hash_of(key, self.hash_id);
        let (_, page, _) = self.directory.page_for_hash(hash)?;
        if iter.page != page {
            iter.page = page;
            iter.index = None;
        }
        let found_idx = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            view.iterate_from(iter.index).into_iter().find(|&idx| {
                let slot = view.slot(idx);
                view.key_bytes(&slot) == key
            })
        };
        match found_idx {
            Some(idx) => {
                iter.index = Some(idx);
                self.touch_entry(page, idx);
                self.read_entry(page, idx).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Advance an entry's access-counter and last-access-time, the
    /// bookkeeping cache-mode eviction scores against. A no-op when
    /// cache mode is NONE, since nothing ever reads those fields then.
    fn touch_entry(&mut self, page: u32, idx: u32) {
        if self.cache_mode == CacheMode::None {
            return;
        }
        let Ok(mut view) = PageView::open(self.store.page_slice_mut(page, 1)) else {
            return;
        };
        let mut slot = view.slot(idx);
        slot.access_counter = slot.access_counter.saturating_add(1);
        self.logical_clock += 1;
        slot.last_access = self.logical_clock;
        view.update_slot(idx, &slot);
    }

    fn read_entry(&mut self, page: u32, idx: u32) -> MdbmResult<Vec<u8>> {
        let view = PageView::open(self.store.page_slice_mut(page, 1))?;
        let slot = view.slot(idx);
        if slot.is_large_object() {
            let bytes = view.value_bytes(&slot);
            let first_page = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            drop(view);
            Ok(self.store.lob_get(first_page)?.to_vec())
        } else {
            Ok(view.value_bytes(&slot).to_vec())
        }
    }

    // ---- store -------------------------------------------------------

    pub fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode, flags: StoreFlags) -> MdbmResult<StoreOutcome> {
        PageView::validate_entry_lengths(key.len(), value.len())?;
        let timer = StatTimer::start(self.time_source);
        let result = self.with_lock(key, LockIntent::Write, |s| s.store_locked(key, value, mode, flags));
        if let Some(stats) = &mut self.stats {
            match &result {
                Ok(_) => stats.record_store(timer.elapsed()),
                Err(_) => stats.record_store_error(),
            }
        }
        result
    }

    /// `RESERVE`: allocate space for `value_len` bytes under `key` without
    /// copying a caller-supplied value in. The zero-filled placeholder is
    /// laid down through the normal `store_into_leaf` path (so it
    /// participates in splits/eviction exactly like any other store), then
    /// handed back as a writable slice borrowed from the mapping. The
    /// write lock taken here is held until the returned `Reserved` drops.
    pub fn store_reserve(&mut self, key: &[u8], value_len: usize, mode: StoreMode) -> MdbmResult<ReserveOutcome<'_>> {
        PageView::validate_entry_lengths(key.len(), value_len)?;
        if let Some(lock) = self.lock.as_mut() {
            lock.lock_smart(key, LockIntent::Write)?;
        }

        let hash = hash_of(key, self.hash_id);
        let placeholder = vec![0u8; value_len];
        let outcome = self.store_into_leaf(key, &placeholder, hash, mode, 0);

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                if let Some(lock) = self.lock.as_mut() {
                    let _ = lock.unlock_smart(key, LockIntent::Write);
                }
                return Err(e);
            }
        };
        if matches!(outcome, StoreOutcome::Exists) {
            if let Some(lock) = self.lock.as_mut() {
                let _ = lock.unlock_smart(key, LockIntent::Write);
            }
            return Ok(ReserveOutcome::Exists);
        }

        let (_, page, _) = self.directory.page_for_hash(hash)?;
        let slot_index = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            view.lookup(key, hash).expect("just inserted by store_into_leaf")
        };

        Ok(ReserveOutcome::Reserved(Reserved {
            mdbm: self,
            key: key.to_vec(),
            page,
            slot_index,
        }))
    }

    fn store_locked(&mut self, key: &[u8], value: &[u8], mode: StoreMode, flags: StoreFlags) -> MdbmResult<StoreOutcome> {
        let hash = hash_of(key, self.hash_id);
        let (_, probe_page, _) = self.directory.page_for_hash(hash)?;
        let existing_probe = {
            let view = PageView::open(self.store.page_slice_mut(probe_page, 1))?;
            view.lookup(key, hash)
        };

        // CACHE_MODIFY writes through to the backing store unconditionally,
        // but only touches the cache (this database's own pages) when the
        // key is already resident there — a key that was never cached stays
        // uncached after a CACHE_MODIFY store.
        if flags.contains(StoreFlags::CACHE_MODIFY) && existing_probe.is_none() {
            if let Some(backing) = &mut self.backing_store {
                backing.store(key, value)?;
            }
            return Ok(StoreOutcome::Stored);
        }

        match mode {
            StoreMode::Insert => {
                if existing_probe.is_some() {
                    return Ok(StoreOutcome::Exists);
                }
            }
            StoreMode::Modify => {
                if existing_probe.is_none() {
                    return Err(MdbmError::NotFound);
                }
            }
            StoreMode::Replace | StoreMode::InsertDup => {}
        }

        let mut entry_flags = 0u8;
        if flags.contains(StoreFlags::CLEAN) {
            entry_flags |= ENTRY_FLAG_CLEAN;
        }
        let is_large = self.large_objects_enabled && value.len() as u32 > self.spill_size;

        // §4.5: replacing/modifying a key that already holds a LOB value
        // first tries an in-place update of the existing chunk, rather
        // than unconditionally freeing it and allocating a new one — only
        // when the new value no longer fits does the normal
        // free-then-allocate path below run.
        if is_large && matches!(mode, StoreMode::Replace | StoreMode::Modify) {
            if let Some(outcome) = self.try_store_lob_in_place(key, value, probe_page, existing_probe, flags)? {
                return Ok(outcome);
            }
        }

        let value_bytes: Vec<u8> = if is_large {
            let first_page = self.store.lob_put(value, probe_page)?;
            entry_flags |= ENTRY_FLAG_LARGE_OBJECT;
            first_page.to_le_bytes().to_vec()
        } else {
            value.to_vec()
        };

        let outcome = self.store_into_leaf(key, &value_bytes, hash, mode, entry_flags);
        if outcome.is_err() && is_large {
            let first_page = u32::from_le_bytes(value_bytes[0..4].try_into().unwrap());
            let _ = self.store.lob_free(first_page);
        }
        if matches!(outcome, Ok(StoreOutcome::Stored)) {
            if !flags.contains(StoreFlags::CACHE_ONLY) {
                if let Some(backing) = &mut self.backing_store {
                    let _ = backing.store(key, value);
                }
            }
        }
        outcome
    }

    /// If `existing` already holds a LOB value and the new `value` still
    /// fits in that chunk's page count, overwrite it in place and report
    /// `Stored` — the slot itself (and the first-page reference it holds)
    /// doesn't change, only the chunk's contents do. Returns `None` when
    /// there's no existing entry, the existing entry isn't a LOB, or the
    /// new value no longer fits, leaving the caller to take the normal
    /// free-then-allocate path.
    fn try_store_lob_in_place(
        &mut self,
        key: &[u8],
        value: &[u8],
        probe_page: u32,
        existing: Option<u32>,
        flags: StoreFlags,
    ) -> MdbmResult<Option<StoreOutcome>> {
        let Some(idx) = existing else { return Ok(None) };
        let existing_first_page = {
            let view = PageView::open(self.store.page_slice_mut(probe_page, 1))?;
            let slot = view.slot(idx);
            if slot.is_large_object() {
                let bytes = view.value_bytes(&slot);
                Some(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))
            } else {
                None
            }
        };
        let Some(first_page) = existing_first_page else { return Ok(None) };
        if !self.store.lob_fits_in_place(first_page, value.len())? {
            return Ok(None);
        }

        self.store.lob_put_in_place(first_page, value)?;
        if flags.contains(StoreFlags::CLEAN) {
            let mut view = PageView::open(self.store.page_slice_mut(probe_page, 1))?;
            let mut slot = view.slot(idx);
            slot.flags |= ENTRY_FLAG_CLEAN;
            view.update_slot(idx, &slot);
        }
        if !flags.contains(StoreFlags::CACHE_ONLY) {
            if let Some(backing) = &mut self.backing_store {
                let _ = backing.store(key, value);
            }
        }
        Ok(Some(StoreOutcome::Stored))
    }

    fn store_into_leaf(&mut self, key: &[u8], value_bytes: &[u8], hash: u32, mode: StoreMode, entry_flags: u8) -> MdbmResult<StoreOutcome> {
        // For REPLACE/MODIFY, the old entry is removed before the new value is
        // laid down. Once that removal has happened, a retry after a
        // page split must not re-check "does the key still exist" — it won't,
        // by construction — and a terminal NoRoom becomes EOVERFLOW instead:
        // the old entry is already gone and the new value still didn't fit.
        let mut old_entry_removed = false;

        loop {
            let (leaf_idx, page, shift) = self.directory.page_for_hash(hash)?;

            let existing = {
                let view = PageView::open(self.store.page_slice_mut(page, 1))?;
                view.lookup(key, hash)
            };
            if !old_entry_removed {
                match mode {
                    StoreMode::Insert => {
                        if existing.is_some() {
                            return Ok(StoreOutcome::Exists);
                        }
                    }
                    StoreMode::Modify => {
                        if existing.is_none() {
                            return Err(MdbmError::NotFound);
                        }
                    }
                    StoreMode::Replace | StoreMode::InsertDup => {}
                }

                if matches!(mode, StoreMode::Replace | StoreMode::Modify) {
                    if let Some(idx) = existing {
                        self.delete_slot_releasing_lob(page, idx)?;
                        old_entry_removed = true;
                    }
                }
            }

            let needed = PageView::required_space(key.len(), value_bytes.len(), self.align);
            {
                let mut view = PageView::open(self.store.page_slice_mut(page, 1))?;
                if view.free_space() < needed && view.recoverable_space() > 0 {
                    view.compact(self.align);
                }
                if view.free_space() >= needed {
                    view.insert_raw(key, value_bytes, hash, self.align, entry_flags);
                    return Ok(StoreOutcome::Stored);
                }
            }

            if shift >= self.directory.max_shift() {
                if self.try_grow_leaf_to_oversized_chunk(leaf_idx, page, needed)? {
                    continue;
                }
                if self.make_room_on_full_leaf(page, needed)? {
                    let mut view = PageView::open(self.store.page_slice_mut(page, 1))?;
                    if view.free_space() < needed && view.recoverable_space() > 0 {
                        view.compact(self.align);
                    }
                    if view.free_space() >= needed {
                        view.insert_raw(key, value_bytes, hash, self.align, entry_flags);
                        return Ok(StoreOutcome::Stored);
                    }
                }
                if old_entry_removed {
                    return Err(MdbmError::ReplaceLost);
                }
                return Err(MdbmError::NoRoom("directory max shift reached".into()));
            }
            self.split_leaf(leaf_idx, page, shift)?;
        }
    }

    /// §4.4: a leaf at `max_shift` can no longer split. Before falling
    /// back to `shake`/eviction, try growing it in place into a bigger,
    /// oversized (multi-page) DATA chunk sized to hold its existing
    /// entries plus the one that didn't fit — the same escape hatch large
    /// objects get, extended to an ordinary leaf that's simply out of
    /// room. Only attempted when large-object support is enabled, since
    /// that's what makes oversized chunks a recognized chunk shape in the
    /// first place. Returns whether the leaf was grown (the caller must
    /// restart its lookup: the leaf's home page has changed).
    fn try_grow_leaf_to_oversized_chunk(&mut self, leaf_idx: mdbm_directory::NodeIndex, page: u32, needed: u32) -> MdbmResult<bool> {
        if !self.large_objects_enabled {
            return Ok(false);
        }

        let entries: Vec<(Vec<u8>, Vec<u8>, u8)> = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            view.iterate_from(None)
                .into_iter()
                .map(|idx| {
                    let slot = view.slot(idx);
                    (view.key_bytes(&slot).to_vec(), view.value_bytes(&slot).to_vec(), slot.flags)
                })
                .collect()
        };

        let live_bytes: u64 = entries
            .iter()
            .map(|(k, v, _)| PageView::required_space(k.len(), v.len(), self.align) as u64)
            .sum();
        let page_size = self.store.page_size() as u64;
        let total_needed = mdbm_storage::PAGE_HEADER_SIZE as u64 + live_bytes + needed as u64;
        let new_pages = (((total_needed + page_size - 1) / page_size) as u32).max(2);

        let new_page = self.store.alloc_chunk(new_pages, ChunkType::Data, 0)?;
        PageView::format(self.store.page_slice_mut(new_page, new_pages));
        {
            let mut view = PageView::open(self.store.page_slice_mut(new_page, new_pages))?;
            for (key, value, flags) in &entries {
                let entry_hash = hash_of(key, self.hash_id);
                view.insert_raw(key, value, entry_hash, self.align, *flags);
            }
        }

        self.directory.replace_leaf_page(leaf_idx, new_page)?;
        self.store.free_chunk(page)?;
        self.save_directory()?;
        Ok(true)
    }

    /// A leaf at `max_shift` is full and cannot split further: the
    /// last-resort path. First the legacy `shake` callback (if
    /// registered) gets a chance to mark entries for deletion; then, in
    /// cache mode, eviction repeatedly removes the current victim until
    /// the insert fits or no candidates remain. Returns whether anything
    /// was freed (the caller re-checks free space either way).
    fn make_room_on_full_leaf(&mut self, page: u32, needed: u32) -> MdbmResult<bool> {
        let mut freed_anything = false;

        if self.shake.is_some() {
            let entries = self.page_entry_metas(page)?;
            let request = ShakeRequest { page, needed_bytes: needed, entries: &entries };
            let victims = self.shake.as_mut().unwrap().shake(&request);
            for idx in victims {
                self.delete_slot_releasing_lob(page, idx)?;
                freed_anything = true;
            }
        }

        if self.cache_mode != CacheMode::None {
            loop {
                let fits = {
                    let view = PageView::open(self.store.page_slice_mut(page, 1))?;
                    view.free_space() + view.recoverable_space() >= needed
                };
                if fits {
                    break;
                }
                let entries = self.page_entry_metas(page)?;
                let Some(victim) = pick_victim(self.cache_mode, self.evict_clean_first, self.gdsf_inflation, &entries) else {
                    break;
                };
                self.delete_slot_releasing_lob(page, victim)?;
                self.gdsf_inflation += 1.0;
                freed_anything = true;
                if let Some(stats) = &mut self.stats {
                    stats.record_cache_evict();
                }
            }
        }

        Ok(freed_anything)
    }

    /// Snapshot of a page's live entries as `EntryMeta`, for the shake and
    /// eviction callbacks to score against.
    fn page_entry_metas(&mut self, page: u32) -> MdbmResult<Vec<EntryMeta>> {
        let view = PageView::open(self.store.page_slice_mut(page, 1))?;
        Ok(view
            .iterate_from(None)
            .into_iter()
            .map(|idx| {
                let slot = view.slot(idx);
                EntryMeta {
                    slot_index: idx,
                    access_counter: slot.access_counter,
                    last_access: slot.last_access,
                    size: slot.key_len + slot.val_len,
                    clean: slot.is_clean(),
                }
            })
            .collect())
    }

    /// Split a full leaf page in two and rehash its entries by the next
    /// hash bit. The old page is freed once its entries have been
    /// redistributed.
    fn split_leaf(&mut self, leaf_idx: mdbm_directory::NodeIndex, old_page: u32, shift: u8) -> MdbmResult<()> {
        let left_page = self.store.alloc_chunk(1, ChunkType::Data, 0)?;
        let right_page = self.store.alloc_chunk(1, ChunkType::Data, 0)?;
        PageView::format(self.store.page_slice_mut(left_page, 1));
        PageView::format(self.store.page_slice_mut(right_page, 1));

        let entries: Vec<(Vec<u8>, Vec<u8>, u8)> = {
            let view = PageView::open(self.store.page_slice_mut(old_page, 1))?;
            view.iterate_from(None)
                .into_iter()
                .map(|idx| {
                    let slot = view.slot(idx);
                    (view.key_bytes(&slot).to_vec(), view.value_bytes(&slot).to_vec(), slot.flags)
                })
                .collect()
        };

        for (key, value, flags) in entries {
            let hash = hash_of(&key, self.hash_id);
            let bit = (hash >> shift) & 1;
            let target_page = if bit == 0 { left_page } else { right_page };
            let mut view = PageView::open(self.store.page_slice_mut(target_page, 1))?;
            view.insert_raw(&key, &value, hash, self.align, flags);
        }

        self.directory.split(leaf_idx, left_page, right_page)?;
        self.store.free_chunk(old_page)?;
        self.save_directory()
    }

    fn delete_slot_releasing_lob(&mut self, page: u32, idx: u32) -> MdbmResult<()> {
        let lob_first_page = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            let slot = view.slot(idx);
            if slot.is_large_object() {
                let bytes = view.value_bytes(&slot);
                Some(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))
            } else {
                None
            }
        };
        if let Some(first_page) = lob_first_page {
            self.store.lob_free(first_page)?;
        }
        let mut view = PageView::open(self.store.page_slice_mut(page, 1))?;
        view.delete_slot(idx);
        Ok(())
    }

    // ---- delete --------------------------------------------------------

    pub fn delete(&mut self, key: &[u8]) -> MdbmResult<()> {
        let timer = StatTimer::start(self.time_source);
        let result = self.with_lock(key, LockIntent::Write, |s| s.delete_locked(key));
        if let Some(stats) = &mut self.stats {
            stats.record_delete(result.is_ok(), timer.elapsed());
        }
        if result.is_ok() {
            if let Some(backing) = &mut self.backing_store {
                let _ = backing.delete(key);
            }
        }
        result
    }

    fn delete_locked(&mut self, key: &[u8]) -> MdbmResult<()> {
        let hash = hash_of(key, self.hash_id);
        let (_, page, _) = self.directory.page_for_hash(hash)?;
        let existing = {
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            view.lookup(key, hash)
        };
        match existing {
            Some(idx) => self.delete_slot_releasing_lob(page, idx),
            None => Err(MdbmError::NotFound),
        }
    }

    // ---- full-table iteration ------------------------------------------
    //
    // `firstkey`/`nextkey`/`first`/`next` advance the handle's own
    // `default_iter`. The `_r` reentrant variants take a caller-supplied
    // `MdbmIter` instead, so two independent passes over the same handle
    // (or a dup-walk interleaved with a full-table walk) can be live at
    // once — each is just a cursor, not a snapshot, so a page fetched
    // through one is immediately visible to the other.

    pub fn firstkey(&mut self) -> MdbmResult<Option<Vec<u8>>> {
        let mut iter = self.default_iter;
        let result = self.firstkey_r(&mut iter);
        self.default_iter = iter;
        result
    }

    pub fn nextkey(&mut self) -> MdbmResult<Option<Vec<u8>>> {
        let mut iter = self.default_iter;
        let result = self.nextkey_r(&mut iter);
        self.default_iter = iter;
        result
    }

    pub fn first(&mut self) -> MdbmResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.default_iter;
        let result = self.first_r(&mut iter);
        self.default_iter = iter;
        result
    }

    pub fn next(&mut self) -> MdbmResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.default_iter;
        let result = self.next_r(&mut iter);
        self.default_iter = iter;
        result
    }

    /// Reentrant `firstkey`: reset `iter` to the start of the table (page
    /// order over the live directory's leaves, slot order within a page)
    /// and return the first key.
    pub fn firstkey_r(&mut self, iter: &mut MdbmIter) -> MdbmResult<Option<Vec<u8>>> {
        iter.reset();
        let leaves = self.leaf_pages();
        self.advance_reentrant_cursor(&leaves, iter)
    }

    /// Reentrant `nextkey`: resume from wherever `iter` was last left.
    /// Leaves are re-read from the live directory on every call, so a
    /// split on another handle mid-walk can make this skip or repeat an
    /// entry rather than corrupt the cursor — documented, not a bug.
    pub fn nextkey_r(&mut self, iter: &mut MdbmIter) -> MdbmResult<Option<Vec<u8>>> {
        let leaves = self.leaf_pages();
        self.advance_reentrant_cursor(&leaves, iter)
    }

    pub fn first_r(&mut self, iter: &mut MdbmIter) -> MdbmResult<Option<(Vec<u8>, Vec<u8>)>> {
        match self.firstkey_r(iter)? {
            Some(key) => {
                let value = self.read_entry(iter.page, iter.index.expect("firstkey_r positions index on Some"))?;
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }

    pub fn next_r(&mut self, iter: &mut MdbmIter) -> MdbmResult<Option<(Vec<u8>, Vec<u8>)>> {
        match self.nextkey_r(iter)? {
            Some(key) => {
                let value = self.read_entry(iter.page, iter.index.expect("nextkey_r positions index on Some"))?;
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }

    fn leaf_pages(&self) -> Vec<u32> {
        self.directory.leaves().into_iter().map(|(_, page)| page).collect()
    }

    /// Shared walk for the `_r` cursor: `iter.page` selects a position
    /// within `leaves` (falling back to the start when that page is no
    /// longer a leaf, e.g. it was consumed by a split), `iter.index`
    /// selects where within that page to resume. On a hit, `iter` is left
    /// positioned on the returned entry, so the next call (on a fresh
    /// `next_r`/`nextkey_r`) continues from there; a deleted current entry
    /// naturally advances to whatever slot took its place, since the
    /// in-page scan re-reads live slot state every call.
    fn advance_reentrant_cursor(&mut self, leaves: &[u32], iter: &mut MdbmIter) -> MdbmResult<Option<Vec<u8>>> {
        let mut leaf_pos = leaves.iter().position(|&p| p == iter.page).unwrap_or(0);
        let mut slot_pos = iter.index;
        loop {
            if leaf_pos >= leaves.len() {
                return Ok(None);
            }
            let page = leaves[leaf_pos];
            let view = PageView::open(self.store.page_slice_mut(page, 1))?;
            if let Some(idx) = view.iterate_from(slot_pos).into_iter().next() {
                let slot = view.slot(idx);
                let key = view.key_bytes(&slot).to_vec();
                iter.page = page;
                iter.index = Some(idx);
                return Ok(Some(key));
            }
            leaf_pos += 1;
            slot_pos = None;
        }
    }

    pub fn iter(&mut self) -> MdbmEntries<'_> {
        MdbmEntries { handle: self, started: false }
    }

    pub(crate) fn store_ref(&self) -> &FileStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut FileStore {
        &mut self.store
    }

    pub(crate) fn directory_ref(&self) -> &Directory {
        &self.directory
    }

    /// Verify on-disk invariants up to `level` (header / chunks /
    /// directory / data) and return a report; never panics on corrupt
    /// input. `verbose` additionally logs each failure at `warn`.
    pub fn check(&mut self, level: crate::check::CheckLevel, verbose: bool) -> crate::check::CheckReport {
        let directory = self.directory.clone();
        crate::check::check(&mut self.store, Some(&directory), level, verbose)
    }

    /// Expose the chunk traversal (type, page, length) to external tools.
    pub fn chunk_iterate(&self, visit: impl FnMut(u32, &mdbm_storage::ChunkHeader)) {
        crate::check::chunk_iterate(&self.store, visit)
    }

    /// Expose one page's live-slot traversal to external tools. `flags` is
    /// reserved for a future skip-deleted filter and is currently unused.
    pub fn iterate_page(&mut self, page: u32, visit: impl FnMut(u32), flags: u32) -> MdbmResult<()> {
        Ok(crate::check::iterate(&mut self.store, page, visit, flags)?)
    }

    /// `clean(page)`: scan one data page's live entries through
    /// `clean_func`, mark the CLEAN bit on every slot the callback
    /// approves, and return those slot indices.
    pub fn clean_page(&mut self, page: u32, clean_func: &mut dyn CleanFunc) -> MdbmResult<Vec<u32>> {
        let entries = self.page_entry_metas(page)?;
        let newly_clean = clean_page(&entries, clean_func);
        let mut view = PageView::open(self.store.page_slice_mut(page, 1))?;
        for idx in &newly_clean {
            let mut slot = view.slot(*idx);
            slot.flags |= ENTRY_FLAG_CLEAN;
            view.update_slot(*idx, &slot);
        }
        Ok(newly_clean)
    }

    /// `clean(all)`: scan every data chunk in file order through
    /// `clean_func`, honoring a `quit` that stops the whole scan (not just
    /// the current page) exactly like the legacy callback's contract.
    pub fn clean_all(&mut self, clean_func: &mut dyn CleanFunc) -> MdbmResult<Vec<(u32, Vec<u32>)>> {
        let mut data_pages = Vec::new();
        self.store.for_each_chunk(|page, header| {
            if header.chunk_type == ChunkType::Data {
                data_pages.push(page);
            }
        })?;

        let mut pages_with_entries = Vec::with_capacity(data_pages.len());
        for page in &data_pages {
            pages_with_entries.push((*page, self.page_entry_metas(*page)?));
        }

        let scanned = clean_all(&pages_with_entries, clean_func);
        for (page, newly_clean) in &scanned {
            let mut view = PageView::open(self.store.page_slice_mut(*page, 1))?;
            for idx in newly_clean {
                let mut slot = view.slot(*idx);
                slot.flags |= ENTRY_FLAG_CLEAN;
                view.update_slot(*idx, &slot);
            }
        }
        Ok(scanned)
    }
}

/// The result of `store_reserve`: either a hole for the caller to fill in,
/// or `Exists`, mirroring `StoreOutcome` for a plain INSERT that loses the
/// race to an already-present key.
pub enum ReserveOutcome<'a> {
    Reserved(Reserved<'a>),
    Exists,
}

/// A write lock held open over a freshly allocated, zero-filled entry.
/// `value_mut` hands back a slice borrowed straight from the mapping; the
/// lock releases when this drops, so callers should fill the value and
/// drop it promptly rather than holding it across unrelated work.
pub struct Reserved<'a> {
    mdbm: &'a mut Mdbm,
    key: Vec<u8>,
    page: u32,
    slot_index: u32,
}

impl<'a> Reserved<'a> {
    pub fn value_mut(&mut self) -> &mut [u8] {
        let (start, end) = {
            let view = PageView::open(self.mdbm.store.page_slice_mut(self.page, 1)).expect("page validated at reservation time");
            let slot = view.slot(self.slot_index);
            (slot.val_offset as usize, (slot.val_offset + slot.val_len) as usize)
        };
        let buf = self.mdbm.store.page_slice_mut(self.page, 1);
        &mut buf[start..end]
    }

    pub fn len(&self) -> usize {
        let view = PageView::open(self.mdbm.store.page_slice_mut(self.page, 1)).expect("page validated at reservation time");
        view.slot(self.slot_index).val_len as usize
    }
}

impl<'a> Drop for Reserved<'a> {
    fn drop(&mut self) {
        if let Some(lock) = self.mdbm.lock.as_mut() {
            let _ = lock.unlock_smart(&self.key, LockIntent::Write);
        }
    }
}

/// Iterator adapter over `first`/`next`'s stateful cursor, for the
/// idiomatic `for (k, v) in handle.iter() { ... }` form.
pub struct MdbmEntries<'a> {
    handle: &'a mut Mdbm,
    started: bool,
}

impl<'a> Iterator for MdbmEntries<'a> {
    type Item = MdbmResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = if !self.started {
            self.started = true;
            self.handle.first()
        } else {
            self.handle.next()
        };
        match step {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// `MDBM_ITER`: an opaque, externally-held cursor over a page and the
/// slot index within it, reentrant across `first_r`/`next_r`/
/// `firstkey_r`/`nextkey_r`/`fetch_dup`. Reinitialize with
/// [`MdbmIter::new`] (or [`MdbmIter::reset`]) to restart a walk; a
/// second, independent `MdbmIter` can be live on the same handle at the
/// same time as the handle's own default cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdbmIter {
    page: u32,
    index: Option<u32>,
}

impl MdbmIter {
    pub fn new() -> Self {
        MdbmIter { page: 0, index: None }
    }

    pub fn reset(&mut self) {
        *self = MdbmIter::new();
    }
}

impl Default for MdbmIter {
    fn default() -> Self {
        MdbmIter::new()
    }
}

/// The MDBM-nested backing-store provider: wraps another, separate
/// `Mdbm` handle as the backing store for a cache-mode handle, which then
/// owns and closes the nested handle.
pub struct NestedMdbmBackingStore {
    inner: Mdbm,
}

impl NestedMdbmBackingStore {
    pub fn new(inner: Mdbm) -> Self {
        NestedMdbmBackingStore { inner }
    }
}

fn to_cache_error(e: MdbmError) -> CacheError {
    CacheError::Io(std::io::Error::other(e.to_string()))
}

impl BackingStore for NestedMdbmBackingStore {
    fn fetch(&mut self, key: &[u8]) -> mdbm_cache::CacheResult<Option<Vec<u8>>> {
        self.inner.fetch(key).map_err(to_cache_error)
    }

    fn store(&mut self, key: &[u8], value: &[u8]) -> mdbm_cache::CacheResult<()> {
        self.inner
            .store(key, value, StoreMode::Replace, StoreFlags::empty())
            .map(|_| ())
            .map_err(to_cache_error)
    }

    fn delete(&mut self, key: &[u8]) -> mdbm_cache::CacheResult<()> {
        match self.inner.delete(key) {
            Ok(()) | Err(MdbmError::NotFound) => Ok(()),
            Err(e) => Err(to_cache_error(e)),
        }
    }

    fn dup(&self) -> mdbm_cache::CacheResult<Box<dyn BackingStore>> {
        Err(CacheError::BackingStoreMiss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MdbmConfig;
    use tempfile::tempdir;

    fn open_fresh(dir: &std::path::Path) -> Mdbm {
        let config = MdbmConfig::default();
        Mdbm::open(dir.join("test.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap()
    }

    #[test]
    fn store_then_fetch_round_trips() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let outcome = db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn store_rejects_a_zero_length_key() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let err = db.store(b"", b"v", StoreMode::Insert, StoreFlags::empty()).unwrap_err();
        assert!(matches!(err, MdbmError::Invalid(_)));
    }

    #[test]
    fn store_rejects_an_oversized_key_or_value() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let oversized_key = vec![b'k'; mdbm_storage::PageView::MAX_KEY_LEN + 1];
        let err = db.store(&oversized_key, b"v", StoreMode::Insert, StoreFlags::empty()).unwrap_err();
        assert!(matches!(err, MdbmError::Invalid(_)));

        let oversized_value = vec![0u8; mdbm_storage::PageView::MAX_VALUE_LEN + 1];
        let err = db.store(b"k", &oversized_value, StoreMode::Insert, StoreFlags::empty()).unwrap_err();
        assert!(matches!(err, MdbmError::Invalid(_)));
    }

    #[test]
    fn store_reserve_rejects_a_zero_length_key() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let err = db.store_reserve(b"", 4, StoreMode::Insert).unwrap_err();
        assert!(matches!(err, MdbmError::Invalid(_)));
    }

    #[test]
    fn insert_on_existing_key_reports_exists_without_overwriting() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        let outcome = db.store(b"k1", b"v2", StoreMode::Insert, StoreFlags::empty()).unwrap();
        assert_eq!(outcome, StoreOutcome::Exists);
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn replace_overwrites_an_existing_key() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.store(b"k1", b"v2", StoreMode::Replace, StoreFlags::empty()).unwrap();
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn modify_on_missing_key_fails() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let err = db.store(b"missing", b"v", StoreMode::Modify, StoreFlags::empty()).unwrap_err();
        assert!(matches!(err, MdbmError::NotFound));
    }

    #[test]
    fn delete_then_fetch_misses() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.delete(b"k1").unwrap();
        assert_eq!(db.fetch(b"k1").unwrap(), None);
        assert!(matches!(db.delete(b"k1").unwrap_err(), MdbmError::NotFound));
    }

    #[test]
    fn large_value_spills_to_a_lob_chunk_and_round_trips() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let big = vec![0xEFu8; db.spill_size as usize + 5000];
        db.store(b"big", &big, StoreMode::Insert, StoreFlags::empty()).unwrap();
        assert_eq!(db.fetch(b"big").unwrap(), Some(big));
    }

    #[test]
    fn lob_replace_with_a_value_that_still_fits_updates_in_place() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let big = vec![0xEFu8; db.spill_size as usize + 5000];
        db.store(b"big", &big, StoreMode::Insert, StoreFlags::empty()).unwrap();
        let pages_before = db.store_ref().page_count();

        let smaller_but_still_large = vec![0x11u8; db.spill_size as usize + 10];
        db.store(b"big", &smaller_but_still_large, StoreMode::Replace, StoreFlags::empty()).unwrap();

        assert_eq!(db.store_ref().page_count(), pages_before);
        assert_eq!(db.fetch(b"big").unwrap(), Some(smaller_but_still_large));
    }

    #[test]
    fn lob_replace_with_a_value_too_big_to_fit_reallocates() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        let big = vec![0xEFu8; db.spill_size as usize + 10];
        db.store(b"big", &big, StoreMode::Insert, StoreFlags::empty()).unwrap();

        let much_bigger = vec![0x22u8; db.spill_size as usize + 50_000];
        db.store(b"big", &much_bigger, StoreMode::Replace, StoreFlags::empty()).unwrap();
        assert_eq!(db.fetch(b"big").unwrap(), Some(much_bigger));
    }

    #[test]
    fn insert_dup_keeps_both_values_reachable_via_fetch_dup_iterator() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k", b"first", StoreMode::InsertDup, StoreFlags::empty()).unwrap();
        db.store(b"k", b"second", StoreMode::InsertDup, StoreFlags::empty()).unwrap();
        let mut iter = MdbmIter::new();
        assert_eq!(db.fetch_dup(b"k", &mut iter).unwrap(), Some(b"first".to_vec()));
        assert_eq!(db.fetch_dup(b"k", &mut iter).unwrap(), Some(b"second".to_vec()));
        assert_eq!(db.fetch_dup(b"k", &mut iter).unwrap(), None);
    }

    #[test]
    fn sixteen_insert_dups_are_all_reachable_from_a_fresh_iterator() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        for i in 0..16 {
            db.store(b"k", format!("v{i}").as_bytes(), StoreMode::InsertDup, StoreFlags::empty()).unwrap();
        }
        let mut iter = MdbmIter::new();
        let mut seen = std::collections::HashSet::new();
        let mut count = 0;
        while let Some(value) = db.fetch_dup(b"k", &mut iter).unwrap() {
            seen.insert(value);
            count += 1;
        }
        assert_eq!(count, 16);
        let expected: std::collections::HashSet<Vec<u8>> = (0..16).map(|i| format!("v{i}").into_bytes()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn reentrant_iterator_and_default_cursor_progress_independently() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"a", b"1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.store(b"b", b"2", StoreMode::Insert, StoreFlags::empty()).unwrap();

        let mut side_iter = MdbmIter::new();
        let first_via_default = db.firstkey().unwrap();
        let first_via_side = db.firstkey_r(&mut side_iter).unwrap();
        assert_eq!(first_via_default, first_via_side);

        let second_via_default = db.nextkey().unwrap();
        let second_via_side = db.nextkey_r(&mut side_iter).unwrap();
        assert_eq!(second_via_default, second_via_side);
        assert_eq!(db.nextkey().unwrap(), None);
        assert_eq!(db.nextkey_r(&mut side_iter).unwrap(), None);
    }

    #[test]
    fn many_inserts_force_a_directory_split_and_stay_reachable() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        for i in 0..200u32 {
            let key = format!("key-{i}");
            db.store(key.as_bytes(), b"value", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }
        for i in 0..200u32 {
            let key = format!("key-{i}");
            assert_eq!(db.fetch(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
        }
        assert!(db.directory.depth() > 0);
    }

    #[test]
    fn full_leaf_at_max_shift_grows_into_an_oversized_chunk_instead_of_failing() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.dir_max_shift = 0;
        config.page_size = 256;
        let mut db = Mdbm::open(dir.path().join("test.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();
        let pages_before = db.store_ref().page_count();

        for i in 0..40u32 {
            let key = format!("key-{i}");
            db.store(key.as_bytes(), b"a modestly sized value", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }

        assert!(db.store_ref().page_count() > pages_before);
        assert_eq!(db.directory.depth(), 0, "max_shift=0 never allows a real split");
        for i in 0..40u32 {
            let key = format!("key-{i}");
            assert_eq!(db.fetch(key.as_bytes()).unwrap(), Some(b"a modestly sized value".to_vec()));
        }
    }

    #[test]
    fn full_table_iteration_visits_every_stored_key_once() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        for i in 0..50u32 {
            let key = format!("key-{i}");
            db.store(key.as_bytes(), b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for pair in db.iter() {
            let (key, _) = pair.unwrap();
            seen.insert(key);
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn reopen_after_close_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.mdbm");
        {
            let config = MdbmConfig::default();
            let mut db = Mdbm::open(&path, OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();
            db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
            db.close().unwrap();
        }
        let config = MdbmConfig::default();
        let mut reopened = Mdbm::open(&path, OpenFlags::RDWR, &config).unwrap();
        assert_eq!(reopened.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn replace_that_cannot_fit_after_removing_the_old_entry_reports_replace_lost() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.page_size = 128;
        config.alignment = 1;
        config.dir_min_shift = 0;
        config.dir_max_shift = 0;
        let mut db = Mdbm::open(dir.path().join("overflow.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();

        db.store(b"k", b"aa", StoreMode::Insert, StoreFlags::empty()).unwrap();
        let big = vec![0x11u8; 60];
        let err = db.store(b"k", &big, StoreMode::Replace, StoreFlags::empty()).unwrap_err();
        assert!(matches!(err, MdbmError::ReplaceLost));
        // The non-atomicity is real: a subsequent fetch sees neither value.
        assert_eq!(db.fetch(b"k").unwrap(), None);
    }

    #[test]
    fn modify_retried_after_a_split_does_not_spuriously_report_not_found() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.page_size = 128;
        let mut db = Mdbm::open(dir.path().join("modify-split.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();

        for i in 0..20u32 {
            let key = format!("k{i}");
            db.store(key.as_bytes(), b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }
        db.store(b"k0", b"bigger-value", StoreMode::Modify, StoreFlags::empty()).unwrap();
        assert_eq!(db.fetch(b"k0").unwrap(), Some(b"bigger-value".to_vec()));
    }

    #[test]
    fn nested_backing_store_serves_a_miss_on_the_front_handle() {
        let dir = tempdir().unwrap();
        let backing_config = MdbmConfig::default();
        let mut backing_db = Mdbm::open(dir.path().join("backing.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &backing_config).unwrap();
        backing_db.store(b"k1", b"from-backing", StoreMode::Insert, StoreFlags::empty()).unwrap();

        let mut front_db = open_fresh(dir.path());
        front_db.set_backing_store(Box::new(NestedMdbmBackingStore::new(backing_db)));
        assert_eq!(front_db.fetch(b"k1").unwrap(), Some(b"from-backing".to_vec()));
    }

    #[test]
    fn clean_page_marks_only_the_slots_the_callback_approves() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k0", b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.store(b"k1", b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();

        let (_, page, _) = db.directory.page_for_hash(hash_of(b"k0", db.hash_id)).unwrap();
        let mut calls = 0u32;
        let newly_clean = db
            .clean_page(page, &mut |_slot: u32, _meta: &mdbm_cache::EntryMeta| {
                calls += 1;
                mdbm_cache::CleanDecision { mark_clean: calls == 1, quit: false }
            })
            .unwrap();
        assert_eq!(newly_clean.len(), 1);

        let metas = db.page_entry_metas(page).unwrap();
        assert_eq!(metas.iter().filter(|m| m.clean).count(), 1);
    }

    #[test]
    fn clean_all_scans_every_data_page_in_file_order() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        for i in 0..30u32 {
            db.store(format!("k{i}").as_bytes(), b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }
        assert!(db.directory.depth() > 0, "need more than one data page for this test to be meaningful");

        let scanned = db
            .clean_all(&mut |_slot: u32, _meta: &mdbm_cache::EntryMeta| mdbm_cache::CleanDecision {
                mark_clean: true,
                quit: false,
            })
            .unwrap();
        assert!(scanned.len() > 1);
        let total_marked: usize = scanned.iter().map(|(_, slots)| slots.len()).sum();
        assert_eq!(total_marked, 30);
    }

    #[test]
    fn store_reserve_hands_back_a_writable_slice_that_round_trips_through_fetch() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        match db.store_reserve(b"k1", 5, StoreMode::Insert).unwrap() {
            ReserveOutcome::Reserved(mut reserved) => {
                assert_eq!(reserved.len(), 5);
                reserved.value_mut().copy_from_slice(b"hello");
            }
            ReserveOutcome::Exists => panic!("key should not exist yet"),
        }
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn store_reserve_on_an_existing_key_under_insert_reports_exists() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        match db.store_reserve(b"k1", 5, StoreMode::Insert).unwrap() {
            ReserveOutcome::Exists => {}
            ReserveOutcome::Reserved(_) => panic!("key already exists"),
        }
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn cache_modify_on_an_uncached_key_writes_through_without_populating_the_cache() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.set_backing_store(Box::new(mdbm_cache::FileBackingStore::open(dir.path().join("backing"), 64, 16).unwrap()));

        let outcome = db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::CACHE_MODIFY).unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        // Written through to the backing store...
        let backing = db.backing_store.as_mut().unwrap();
        assert_eq!(backing.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
        // ...but this handle's own pages were never touched, so a fetch
        // with no backing store attached sees nothing.
        db.backing_store = None;
        assert_eq!(db.fetch(b"k1").unwrap(), None);
    }

    #[test]
    fn cache_modify_on_an_already_cached_key_updates_both_cache_and_backing_store() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.set_backing_store(Box::new(mdbm_cache::FileBackingStore::open(dir.path().join("backing"), 64, 16).unwrap()));

        db.store(b"k1", b"v2", StoreMode::Replace, StoreFlags::CACHE_MODIFY).unwrap();
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn lru_cache_eviction_makes_room_on_a_full_leaf_that_cannot_split() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.page_size = 256;
        config.alignment = 1;
        config.dir_min_shift = 0;
        config.dir_max_shift = 0; // no split possible: eviction is the only way to make room
        config.cache_mode = mdbm_cache::CacheMode::Lru as u8;
        let mut db = Mdbm::open(dir.path().join("lru.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();

        db.store(b"keep", b"0123456789", StoreMode::Insert, StoreFlags::empty()).unwrap();

        // Keep inserting new keys, touching "keep" every round so it
        // stays most-recently-used and is never the eviction victim.
        for i in 0..40u32 {
            db.fetch(b"keep").unwrap();
            let key = format!("k{i}");
            let _ = db.store(key.as_bytes(), b"0123456789", StoreMode::Insert, StoreFlags::empty());
        }

        assert_eq!(db.fetch(b"keep").unwrap(), Some(b"0123456789".to_vec()));
        assert!(db.stats().unwrap().cache_evict > 0);
    }

    #[test]
    fn shake_callback_frees_the_slots_it_names_before_a_retry() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.page_size = 200;
        config.alignment = 1;
        config.dir_min_shift = 0;
        config.dir_max_shift = 0;
        let mut db = Mdbm::open(dir.path().join("shake.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();

        db.store(b"sacrifice", b"0123456789", StoreMode::Insert, StoreFlags::empty()).unwrap();
        for i in 0..20u32 {
            let key = format!("k{i}");
            if db.store(key.as_bytes(), b"0123456789", StoreMode::Insert, StoreFlags::empty()).is_err() {
                break;
            }
        }
        assert!(db.fetch(b"sacrifice").unwrap().is_some());

        db.set_shake_func(Box::new(|request: &mdbm_cache::ShakeRequest| {
            request.entries.first().map(|e| vec![e.slot_index]).unwrap_or_default()
        }));
        let outcome = db.store(b"new-after-shake", b"0123456789", StoreMode::Insert, StoreFlags::empty());
        assert_eq!(outcome.unwrap(), StoreOutcome::Stored);
    }

    #[test]
    fn windowed_open_refuses_page_locking() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.page_size = 4096;
        config.window_size = 4096 * 4;
        let mut db = Mdbm::open(dir.path().join("windowed.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::OPEN_WINDOWED, &config).unwrap();

        assert_eq!(db.window_slot_count(), Some(4));
        assert!(matches!(db.lock_pages().unwrap_err(), MdbmError::Unsupported(_)));
    }

    #[test]
    fn pre_split_pages_creates_multiple_leaves_before_any_data_exists() {
        let dir = tempdir().unwrap();
        let mut config = MdbmConfig::default();
        config.pre_split_pages = 5;
        let db = Mdbm::open(dir.path().join("presplit.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT, &config).unwrap();
        assert_eq!(db.directory.depth(), 3); // ceil(log2(5)) == 3, rounded up to 8 leaves

        let mut data_chunks = 0;
        db.chunk_iterate(|_page, header| {
            if header.chunk_type == mdbm_storage::ChunkType::Data {
                data_chunks += 1;
            }
        });
        assert_eq!(data_chunks, 8);
    }

    #[test]
    fn chunk_iterate_visits_every_chunk_and_iterate_page_visits_every_live_slot() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        db.store(b"k1", b"v1", StoreMode::Insert, StoreFlags::empty()).unwrap();
        db.store(b"k2", b"v2", StoreMode::Insert, StoreFlags::empty()).unwrap();

        let mut chunk_count = 0;
        db.chunk_iterate(|_page, _header| chunk_count += 1);
        assert!(chunk_count > 0);

        let (_, page, _) = db.directory.page_for_hash(hash_of(b"k1", db.hash_id)).unwrap();
        let mut slots = Vec::new();
        db.iterate_page(page, |idx| slots.push(idx), 0).unwrap();
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn check_reports_no_problems_on_a_freshly_populated_database() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path());
        for i in 0..10u32 {
            let key = format!("k{i}");
            db.store(key.as_bytes(), b"v", StoreMode::Insert, StoreFlags::empty()).unwrap();
        }
        let report = db.check(crate::check::CheckLevel::Data, false);
        assert!(report.ok(), "{:?}", report.problems);
    }

    #[test]
    fn windowed_open_without_a_window_size_is_rejected() {
        let dir = tempdir().unwrap();
        let config = MdbmConfig::default();
        let err = Mdbm::open(dir.path().join("windowed.mdbm"), OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::OPEN_WINDOWED, &config).unwrap_err();
        assert!(matches!(err, MdbmError::Invalid(_)));
    }
}
