//! Chunk headers: the small typed record at the start of every chunk's
//! first page. Chunks tile the file from page 1 onward; `length_pages` and
//! `prev_length_pages` let a walker cover the file forwards from page 1 or
//! backwards from the last chunk, and must always agree.

use crate::data_util::{ByteReader, ByteWriter, fletcher32};
use crate::error::{StorageError, StorageResult};

pub const CHUNK_MAGIC: [u8; 4] = *b"CHNK";
pub const CHUNK_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Free = 0,
    Data = 1,
    Dir = 2,
    Lob = 3,
}

impl ChunkType {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        match value {
            0 => Ok(ChunkType::Free),
            1 => Ok(ChunkType::Data),
            2 => Ok(ChunkType::Dir),
            3 => Ok(ChunkType::Lob),
            other => Err(StorageError::Corrupt {
                what: "chunk header",
                reason: format!("unknown chunk type {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    /// Length of this chunk, in pages.
    pub length_pages: u32,
    /// Length of the immediately preceding chunk, in pages; 0 for the
    /// first chunk (at page 1). Enables a backward walk for consistency
    /// checking.
    pub prev_length_pages: u32,
    /// Back-reference to the directory node that owns this chunk, for DATA
    /// chunks only. A lookup aid for `check()`, not an ownership edge.
    pub owner_dir_page: u32,
    /// Live entry count, mirrored from the data-page header for DATA
    /// chunks so `for_each_chunk` can report occupancy without paging in
    /// the rest of the chunk.
    pub occupancy: u32,
}

impl ChunkHeader {
    pub fn encode(&self, page: &mut [u8]) {
        assert!(page.len() >= CHUNK_HEADER_SIZE);
        let mut w = ByteWriter::new(&mut page[..CHUNK_HEADER_SIZE]);
        w.write_bytes(&CHUNK_MAGIC);
        w.write_u8(self.chunk_type as u8);
        w.skip(3); // padding, keeps the rest 4-byte aligned
        w.write_u32(self.length_pages);
        w.write_u32(self.prev_length_pages);
        w.write_u32(self.owner_dir_page);
        w.write_u32(self.occupancy);

        let checksum_pos = CHUNK_HEADER_SIZE - 4;
        let checksum = fletcher32(&page[..checksum_pos]);
        page[checksum_pos..CHUNK_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    }

    pub fn decode(page: &[u8]) -> StorageResult<Self> {
        if page.len() < CHUNK_HEADER_SIZE {
            return Err(StorageError::Corrupt {
                what: "chunk header",
                reason: "page shorter than chunk header".into(),
            });
        }

        let checksum_pos = CHUNK_HEADER_SIZE - 4;
        let stored = u32::from_le_bytes(page[checksum_pos..CHUNK_HEADER_SIZE].try_into().unwrap());
        if stored != fletcher32(&page[..checksum_pos]) {
            return Err(StorageError::ChecksumMismatch { what: "chunk header" });
        }

        let mut r = ByteReader::new(&page[..CHUNK_HEADER_SIZE]);
        let magic: [u8; 4] = r.read_bytes(4).try_into().unwrap();
        if magic != CHUNK_MAGIC {
            return Err(StorageError::BadMagic { what: "chunk header" });
        }
        let chunk_type = ChunkType::from_u8(r.read_u8())?;
        r.skip(3);
        let length_pages = r.read_u32();
        let prev_length_pages = r.read_u32();
        let owner_dir_page = r.read_u32();
        let occupancy = r.read_u32();

        Ok(ChunkHeader {
            chunk_type,
            length_pages,
            prev_length_pages,
            owner_dir_page,
            occupancy,
        })
    }
}
