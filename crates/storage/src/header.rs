//! The file header lives in page 0. It records every open-time choice that
//! must survive a close/reopen cycle: page size, alignment, hash id,
//! large-object spill threshold, cache mode, partition count, the
//! directory's location, and the file's high-water mark.

use crate::data_util::{ByteReader, ByteWriter, fletcher32};
use crate::error::{StorageError, StorageResult};

pub const MAGIC: [u8; 4] = *b"MDBM";
pub const FORMAT_VERSION: u8 = 3;

pub const MIN_PAGE_SIZE: u32 = 128;
pub const MAX_PAGE_SIZE: u32 = 16 * 1024 * 1024 - 64;

/// Where the extendible-hash directory bitmap lives: inline in the header
/// (small-footprint mode, bitmap <= 8 bytes) or in its own DIR chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLocation {
    Inline([u8; 8]),
    Chunk { first_page: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
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
    pub file_size_hwm_pages: u32,
    pub dir_location: DirLocation,
    pub stats_enabled: bool,
}

/// Header layout is fixed-size and always fits in page 0, even at the
/// minimum 128-byte page size.
pub const HEADER_SIZE: usize = 64;

impl FileHeader {
    pub fn validate_page_size(page_size: u32) -> StorageResult<()> {
        if page_size < MIN_PAGE_SIZE
            || page_size > MAX_PAGE_SIZE
            || page_size % 64 != 0
        {
            return Err(StorageError::InvalidPageSize(page_size));
        }
        Ok(())
    }

    pub fn validate_alignment(alignment: u8) -> StorageResult<()> {
        match alignment {
            1 | 2 | 4 | 8 => Ok(()),
            other => Err(StorageError::InvalidAlignment(other)),
        }
    }

    pub fn encode(&self, page: &mut [u8]) {
        assert!(page.len() >= HEADER_SIZE, "page 0 must be >= HEADER_SIZE");

        let mut w = ByteWriter::new(&mut page[..HEADER_SIZE]);
        w.write_bytes(&MAGIC);
        w.write_u8(FORMAT_VERSION);
        w.write_u32(self.page_size);
        w.write_u8(self.alignment);
        w.write_u8(self.hash_id);
        w.write_u8(self.dir_min_shift);
        w.write_u8(self.dir_max_shift);
        w.write_u8(self.cache_mode);
        w.write_u8(self.evict_clean_first as u8);
        w.write_u8(self.large_objects_enabled as u8);
        w.write_u32(self.spill_size);
        w.write_u32(self.limit_pages);
        w.write_u32(self.partition_count);
        w.write_u32(self.file_size_hwm_pages);
        match self.dir_location {
            DirLocation::Inline(bytes) => {
                w.write_u8(0);
                w.write_bytes(&bytes);
                w.write_u32(0);
            }
            DirLocation::Chunk { first_page } => {
                w.write_u8(1);
                w.write_bytes(&[0u8; 8]);
                w.write_u32(first_page);
            }
        }
        w.write_u8(self.stats_enabled as u8);

        // Checksum covers everything written above; stash it in the last
        // 4 bytes of the fixed header region.
        let checksum_pos = HEADER_SIZE - 4;
        let checksum = fletcher32(&page[..checksum_pos]);
        page[checksum_pos..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    }

    pub fn decode(page: &[u8]) -> StorageResult<Self> {
        if page.len() < HEADER_SIZE {
            return Err(StorageError::Corrupt {
                what: "file header",
                reason: "page 0 shorter than header".into(),
            });
        }

        let checksum_pos = HEADER_SIZE - 4;
        let stored_checksum =
            u32::from_le_bytes(page[checksum_pos..HEADER_SIZE].try_into().unwrap());
        let computed = fletcher32(&page[..checksum_pos]);
        if stored_checksum != computed {
            return Err(StorageError::ChecksumMismatch { what: "file header" });
        }

        let mut r = ByteReader::new(&page[..HEADER_SIZE]);
        let magic: [u8; 4] = r.read_bytes(4).try_into().unwrap();
        if magic != MAGIC {
            return Err(StorageError::BadMagic { what: "file header" });
        }
        let version = r.read_u8();
        if version != FORMAT_VERSION {
            return Err(StorageError::Corrupt {
                what: "file header",
                reason: format!("unsupported format version {version}"),
            });
        }

        let page_size = r.read_u32();
        let alignment = r.read_u8();
        let hash_id = r.read_u8();
        let dir_min_shift = r.read_u8();
        let dir_max_shift = r.read_u8();
        let cache_mode = r.read_u8();
        let evict_clean_first = r.read_u8() != 0;
        let large_objects_enabled = r.read_u8() != 0;
        let spill_size = r.read_u32();
        let limit_pages = r.read_u32();
        let partition_count = r.read_u32();
        let file_size_hwm_pages = r.read_u32();
        let dir_tag = r.read_u8();
        let dir_inline: [u8; 8] = r.read_bytes(8).try_into().unwrap();
        let dir_chunk_page = r.read_u32();
        let stats_enabled = r.read_u8() != 0;

        let dir_location = match dir_tag {
            0 => DirLocation::Inline(dir_inline),
            1 => DirLocation::Chunk {
                first_page: dir_chunk_page,
            },
            other => {
                return Err(StorageError::Corrupt {
                    what: "file header",
                    reason: format!("unknown directory location tag {other}"),
                });
            }
        };

        Ok(FileHeader {
            page_size,
            alignment,
            hash_id,
            dir_min_shift,
            dir_max_shift,
            cache_mode,
            evict_clean_first,
            large_objects_enabled,
            spill_size,
            limit_pages,
            partition_count,
            file_size_hwm_pages,
            dir_location,
            stats_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileHeader {
        FileHeader {
            page_size: 4096,
            alignment: 8,
            hash_id: 5,
            dir_min_shift: 0,
            dir_max_shift: 20,
            cache_mode: 0,
            evict_clean_first: false,
            large_objects_enabled: true,
            spill_size: 3072,
            limit_pages: 128,
            partition_count: 0,
            file_size_hwm_pages: 1,
            dir_location: DirLocation::Inline([0; 8]),
            stats_enabled: true,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let header = sample();
        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        let decoded = FileHeader::decode(&page).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let header = sample();
        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        page[0] = b'X';
        assert!(matches!(
            FileHeader::decode(&page),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let header = sample();
        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        let last = page.len() - 1;
        page[last] ^= 0xFF;
        assert!(matches!(
            FileHeader::decode(&page),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn page_size_validation() {
        assert!(FileHeader::validate_page_size(4096).is_ok());
        assert!(FileHeader::validate_page_size(127).is_err());
        assert!(FileHeader::validate_page_size(100).is_err());
        assert!(FileHeader::validate_page_size(MAX_PAGE_SIZE + 64).is_err());
    }

    #[test]
    fn alignment_validation() {
        for ok in [1u8, 2, 4, 8] {
            assert!(FileHeader::validate_alignment(ok).is_ok());
        }
        assert!(FileHeader::validate_alignment(3).is_err());
    }

    #[test]
    fn dir_location_chunk_variant_round_trips() {
        let mut header = sample();
        header.dir_location = DirLocation::Chunk { first_page: 42 };
        let mut page = vec![0u8; 4096];
        header.encode(&mut page);
        assert_eq!(FileHeader::decode(&page).unwrap().dir_location, header.dir_location);
    }
}
