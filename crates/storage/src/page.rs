//! Data page layout: a page header, a grow-up heap of key/value bytes, and
//! a grow-down footer of fixed-size entry slots. Slot 0 is reserved as a
//! zero-length sentinel so that `key_offset == 0` unambiguously marks "not
//! a user entry".

use crate::data_util::{ByteReader, ByteWriter, fletcher32};
use crate::error::{StorageError, StorageResult};

pub const PAGE_HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 32;

pub const ENTRY_FLAG_DELETED: u8 = 0x01;
pub const ENTRY_FLAG_LARGE_OBJECT: u8 = 0x02;
pub const ENTRY_FLAG_CLEAN: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntrySlot {
    /// Offset of the key's bytes within the page's usable area. 0 marks an
    /// unused/sentinel slot.
    pub key_offset: u32,
    pub key_len: u32,
    pub val_offset: u32,
    /// For a `LARGE_OBJECT` entry this is the size of the fixed LOB
    /// descriptor stored here, not the real value length (see
    /// `crate::lob`).
    pub val_len: u32,
    /// Low 16 bits of the full 32-bit key hash; a cheap prefilter before a
    /// byte-for-byte key comparison.
    pub hash_frag: u16,
    pub flags: u8,
    /// Cache-mode bookkeeping (unused when cache mode is NONE).
    pub access_counter: u32,
    pub last_access: u64,
}

impl EntrySlot {
    pub fn is_sentinel(&self) -> bool {
        self.key_offset == 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & ENTRY_FLAG_DELETED != 0
    }

    pub fn is_large_object(&self) -> bool {
        self.flags & ENTRY_FLAG_LARGE_OBJECT != 0
    }

    pub fn is_clean(&self) -> bool {
        self.flags & ENTRY_FLAG_CLEAN != 0
    }

    fn encode(&self, buf: &mut [u8]) {
        let mut w = ByteWriter::new(&mut buf[..SLOT_SIZE]);
        w.write_u32(self.key_offset);
        w.write_u32(self.key_len);
        w.write_u32(self.val_offset);
        w.write_u32(self.val_len);
        w.write_u16(self.hash_frag);
        w.write_u8(self.flags);
        w.skip(1);
        w.write_u32(self.access_counter);
        w.write_u64(self.last_access);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut r = ByteReader::new(&buf[..SLOT_SIZE]);
        let key_offset = r.read_u32();
        let key_len = r.read_u32();
        let val_offset = r.read_u32();
        let val_len = r.read_u32();
        let hash_frag = r.read_u16();
        let flags = r.read_u8();
        r.skip(1);
        let access_counter = r.read_u32();
        let last_access = r.read_u64();
        EntrySlot {
            key_offset,
            key_len,
            val_offset,
            val_len,
            hash_frag,
            flags,
            access_counter,
            last_access,
        }
    }
}

struct PageHeaderFields {
    entry_count: u32,
    heap_top: u32,
    deleted_bytes: u32,
}

fn encode_page_header(buf: &mut [u8], fields: &PageHeaderFields) {
    let mut w = ByteWriter::new(&mut buf[..PAGE_HEADER_SIZE]);
    w.write_u32(fields.entry_count);
    w.write_u32(fields.heap_top);
    w.write_u32(fields.deleted_bytes);
    w.write_u32(0); // reserved
    let checksum_pos = PAGE_HEADER_SIZE - 4;
    let checksum = fletcher32(&buf[..checksum_pos]);
    buf[checksum_pos..PAGE_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
}

fn decode_page_header(buf: &[u8]) -> StorageResult<PageHeaderFields> {
    let checksum_pos = PAGE_HEADER_SIZE - 4;
    let stored = u32::from_le_bytes(buf[checksum_pos..PAGE_HEADER_SIZE].try_into().unwrap());
    if stored != fletcher32(&buf[..checksum_pos]) {
        return Err(StorageError::ChecksumMismatch { what: "data page header" });
    }
    let mut r = ByteReader::new(&buf[..PAGE_HEADER_SIZE]);
    let entry_count = r.read_u32();
    let heap_top = r.read_u32();
    let deleted_bytes = r.read_u32();
    Ok(PageHeaderFields {
        entry_count,
        heap_top,
        deleted_bytes,
    })
}

/// A live view over one data page's usable byte range (the chunk's bytes
/// after its `ChunkHeader`). Every accessor bounds-checks against
/// `capacity`; nothing here ever reads or writes outside the slice it was
/// built from, so a `PageView` can never reach into a neighbouring chunk.
pub struct PageView<'a> {
    buf: &'a mut [u8],
}

impl<'a> PageView<'a> {
    pub fn capacity(buf: &[u8]) -> usize {
        buf.len()
    }

    /// Format a freshly allocated page: header plus the reserved sentinel
    /// slot at index 0.
    pub fn format(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len() as u32;
        assert!(
            capacity as usize >= PAGE_HEADER_SIZE + SLOT_SIZE,
            "page too small to hold header + sentinel slot"
        );
        let mut view = PageView { buf };
        view.write_header(&PageHeaderFields {
            entry_count: 1,
            heap_top: PAGE_HEADER_SIZE as u32,
            deleted_bytes: 0,
        });
        view.write_slot(0, &EntrySlot::default());
        view
    }

    pub fn open(buf: &'a mut [u8]) -> StorageResult<Self> {
        decode_page_header(buf)?;
        Ok(PageView { buf })
    }

    fn header(&self) -> PageHeaderFields {
        decode_page_header(self.buf).expect("page header validated on open")
    }

    fn write_header(&mut self, fields: &PageHeaderFields) {
        encode_page_header(self.buf, fields);
    }

    pub fn entry_count(&self) -> u32 {
        self.header().entry_count
    }

    pub fn heap_top(&self) -> u32 {
        self.header().heap_top
    }

    pub fn deleted_bytes(&self) -> u32 {
        self.header().deleted_bytes
    }

    fn footer_start(&self) -> u32 {
        self.buf.len() as u32 - self.entry_count() * SLOT_SIZE as u32
    }

    /// Bytes available for a new entry's key/value/slot, *before* trying a
    /// compact.
    pub fn free_space(&self) -> u32 {
        self.footer_start() - self.heap_top()
    }

    /// Bytes that would become available by compacting away deleted
    /// entries (heap bytes only; the slot footer is not shrunk by
    /// compact, only rewritten).
    pub fn recoverable_space(&self) -> u32 {
        self.deleted_bytes()
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.buf.len() - (index as usize + 1) * SLOT_SIZE
    }

    pub fn slot(&self, index: u32) -> EntrySlot {
        assert!(index < self.entry_count());
        EntrySlot::decode(&self.buf[self.slot_offset(index)..])
    }

    fn write_slot(&mut self, index: u32, slot: &EntrySlot) {
        let offset = self.slot_offset(index);
        slot.encode(&mut self.buf[offset..]);
    }

    pub fn key_bytes(&self, slot: &EntrySlot) -> &[u8] {
        let start = slot.key_offset as usize;
        &self.buf[start..start + slot.key_len as usize]
    }

    pub fn value_bytes(&self, slot: &EntrySlot) -> &[u8] {
        let start = slot.val_offset as usize;
        &self.buf[start..start + slot.val_len as usize]
    }

    /// Largest key accepted by `validate_entry_lengths`, carried from
    /// `original_source/include/mdbm.h`'s `MDBM_KEYLEN_MAX`.
    pub const MAX_KEY_LEN: usize = 1 << 15;

    /// Largest value accepted by `validate_entry_lengths`, carried from
    /// `original_source/include/mdbm.h`'s `MDBM_VALLEN_MAX`.
    pub const MAX_VALUE_LEN: usize = 1 << 24;

    /// Reject a zero-length key or a key/value past the size limits
    /// before any insert is attempted, so an oversized request fails
    /// with `EINVAL` up front rather than falling through directory-split
    /// retries into `NoRoom`/`ReplaceLost`.
    pub fn validate_entry_lengths(key_len: usize, val_len: usize) -> StorageResult<()> {
        if key_len == 0 {
            return Err(StorageError::ZeroLengthKey);
        }
        if key_len > Self::MAX_KEY_LEN {
            return Err(StorageError::KeyTooLarge(key_len));
        }
        if val_len > Self::MAX_VALUE_LEN {
            return Err(StorageError::ValueTooLarge(val_len));
        }
        Ok(())
    }

    /// Required heap+footer bytes to insert `key`/`value` at the given
    /// alignment: `align(key_len) + align(val_len) + SLOT_SIZE`.
    pub fn required_space(key_len: usize, val_len: usize, align: u8) -> u32 {
        crate::data_util::align_up(key_len as u32, align)
            + crate::data_util::align_up(val_len as u32, align)
            + SLOT_SIZE as u32
    }

    /// Append `key`/`value` as a new entry, returning its slot index.
    /// Caller must have already checked `free_space() >= required_space`.
    pub fn insert_raw(
        &mut self,
        key: &[u8],
        value: &[u8],
        hash: u32,
        align: u8,
        flags: u8,
    ) -> u32 {
        let mut h = self.header();
        let key_aligned = crate::data_util::align_up(key.len() as u32, align);
        let val_aligned = crate::data_util::align_up(value.len() as u32, align);

        let key_offset = h.heap_top;
        self.buf[key_offset as usize..key_offset as usize + key.len()].copy_from_slice(key);
        let val_offset = key_offset + key_aligned;
        self.buf[val_offset as usize..val_offset as usize + value.len()].copy_from_slice(value);

        h.heap_top = val_offset + val_aligned;
        let slot_index = h.entry_count;
        h.entry_count += 1;
        self.write_header(&h);

        let slot = EntrySlot {
            key_offset,
            key_len: key.len() as u32,
            val_offset,
            val_len: value.len() as u32,
            hash_frag: (hash & 0xFFFF) as u16,
            flags,
            access_counter: 0,
            last_access: 0,
        };
        self.write_slot(slot_index, &slot);
        slot_index
    }

    pub fn update_slot(&mut self, index: u32, slot: &EntrySlot) {
        self.write_slot(index, slot);
    }

    /// Mark `index` deleted (lazy tombstone); its heap bytes become
    /// recoverable on the next `compact`.
    pub fn delete_slot(&mut self, index: u32) {
        let mut slot = self.slot(index);
        if slot.is_deleted() {
            return;
        }
        let freed = crate::data_util::align_up(slot.key_len, self.alignment_hint())
            + crate::data_util::align_up(slot.val_len, self.alignment_hint());
        slot.flags |= ENTRY_FLAG_DELETED;
        self.write_slot(index, &slot);
        let mut h = self.header();
        h.deleted_bytes += freed;
        self.write_header(&h);
    }

    /// Alignment isn't stored per-page (it's a database-wide, immutable
    /// setting); callers that need exact byte accounting during compact
    /// pass it in explicitly. This conservative guess (1-byte alignment)
    /// is only used by `delete_slot`'s stat bookkeeping and never affects
    /// correctness, only the `recoverable_space` hint.
    fn alignment_hint(&self) -> u8 {
        1
    }

    /// Rewrite the heap, dropping deleted entries' bytes and compacting
    /// live entries upward from `PAGE_HEADER_SIZE`. Slot indices are
    /// preserved (a slot for a deleted entry becomes a dead, zero-length
    /// marker rather than being removed, so existing iterator positions
    /// stay meaningful).
    pub fn compact(&mut self, align: u8) {
        let capacity = self.buf.len();
        let entry_count = self.entry_count();
        let mut entries: Vec<(u32, EntrySlot)> = (0..entry_count)
            .map(|i| (i, self.slot(i)))
            .collect();

        let mut heap = vec![0u8; capacity];
        let mut heap_top = PAGE_HEADER_SIZE as u32;

        for (_, slot) in entries.iter_mut() {
            if slot.is_sentinel() || slot.is_deleted() {
                slot.key_offset = 0;
                slot.val_offset = 0;
                continue;
            }
            let key = self.buf[slot.key_offset as usize..(slot.key_offset + slot.key_len) as usize].to_vec();
            let value = self.buf[slot.val_offset as usize..(slot.val_offset + slot.val_len) as usize].to_vec();

            let key_aligned = crate::data_util::align_up(slot.key_len, align);
            let val_aligned = crate::data_util::align_up(slot.val_len, align);
            let new_key_offset = heap_top;
            heap[new_key_offset as usize..new_key_offset as usize + key.len()].copy_from_slice(&key);
            let new_val_offset = new_key_offset + key_aligned;
            heap[new_val_offset as usize..new_val_offset as usize + value.len()].copy_from_slice(&value);
            heap_top = new_val_offset + val_aligned;

            slot.key_offset = new_key_offset;
            slot.val_offset = new_val_offset;
        }

        self.buf[PAGE_HEADER_SIZE..].copy_from_slice(&heap[PAGE_HEADER_SIZE..]);
        for (index, slot) in &entries {
            self.write_slot(*index, slot);
        }
        self.write_header(&PageHeaderFields {
            entry_count,
            heap_top,
            deleted_bytes: 0,
        });
    }

    /// Linear scan for a matching, non-deleted entry. Prefilters on the
    /// stored hash fragment before a byte comparison; rejects zero-length
    /// keys.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<u32> {
        if key.is_empty() {
            return None;
        }
        let frag = (hash & 0xFFFF) as u16;
        for i in 1..self.entry_count() {
            let slot = self.slot(i);
            if slot.is_sentinel() || slot.is_deleted() {
                continue;
            }
            if slot.hash_frag != frag {
                continue;
            }
            if self.key_bytes(&slot) == key {
                return Some(i);
            }
        }
        None
    }

    /// Iterate live (non-deleted, non-sentinel) slot indices starting
    /// strictly after `after`.
    pub fn iterate_from(&self, after: Option<u32>) -> Vec<u32> {
        let start = after.map(|i| i + 1).unwrap_or(1);
        (start..self.entry_count())
            .filter(|&i| {
                let slot = self.slot(i);
                !slot.is_sentinel() && !slot.is_deleted()
            })
            .collect()
    }
}
