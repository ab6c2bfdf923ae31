//! Selectable hash-function family used to map a key's bytes to a 32-bit
//! hash value. The hash id is chosen once, at database-creation time, and
//! stored in the file header (see `mdbm-storage`'s header codec); changing
//! it later silently orphans every existing entry, so callers must treat it
//! as immutable for the life of a file.

mod algorithms;

use std::fmt;

/// Identifies one of the fixed table of hash functions. The numeric value
/// is what gets persisted in the on-disk header, so the discriminants must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashId {
    Crc32 = 0,
    Ejb = 1,
    Phong = 2,
    Oz = 3,
    Torek = 4,
    Fnv = 5,
    Stl = 6,
    Md5 = 7,
    Sha1 = 8,
    Jenkins = 9,
    Hsieh = 10,
}

/// The default hash family.
pub const DEFAULT_HASH_ID: HashId = HashId::Fnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownHashId(pub u8);

impl fmt::Display for UnknownHashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hash id: {}", self.0)
    }
}

impl std::error::Error for UnknownHashId {}

impl HashId {
    pub fn from_u8(value: u8) -> Result<Self, UnknownHashId> {
        match value {
            0 => Ok(HashId::Crc32),
            1 => Ok(HashId::Ejb),
            2 => Ok(HashId::Phong),
            3 => Ok(HashId::Oz),
            4 => Ok(HashId::Torek),
            5 => Ok(HashId::Fnv),
            6 => Ok(HashId::Stl),
            7 => Ok(HashId::Md5),
            8 => Ok(HashId::Sha1),
            9 => Ok(HashId::Jenkins),
            10 => Ok(HashId::Hsieh),
            other => Err(UnknownHashId(other)),
        }
    }
}

/// Hash `key` with the function selected by `id`.
pub fn hash_of(key: &[u8], id: HashId) -> u32 {
    match id {
        HashId::Crc32 => algorithms::crc32(key),
        HashId::Ejb => algorithms::ejb(key),
        HashId::Phong => algorithms::phong(key),
        HashId::Oz => algorithms::oz(key),
        HashId::Torek => algorithms::torek(key),
        HashId::Fnv => algorithms::fnv(key),
        HashId::Stl => algorithms::stl(key),
        HashId::Md5 => algorithms::md5(key),
        HashId::Sha1 => algorithms::sha1(key),
        HashId::Jenkins => algorithms::jenkins(key),
        HashId::Hsieh => algorithms::hsieh(key),
    }
}

/// Map a 32-bit hash to one of `partition_count` partitions for the
/// partitioned-lock scheme. `partition_count` is required to be non-zero.
pub fn partition_of(hash: u32, partition_count: usize) -> usize {
    debug_assert!(partition_count > 0, "partition_count must be non-zero");
    (hash as usize) % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_hash_id_round_trips_through_from_u8() {
        for id in [
            HashId::Crc32,
            HashId::Ejb,
            HashId::Phong,
            HashId::Oz,
            HashId::Torek,
            HashId::Fnv,
            HashId::Stl,
            HashId::Md5,
            HashId::Sha1,
            HashId::Jenkins,
            HashId::Hsieh,
        ] {
            assert_eq!(HashId::from_u8(id as u8), Ok(id));
        }
        assert_eq!(HashId::from_u8(255), Err(UnknownHashId(255)));
    }

    #[test]
    fn same_key_same_hash_for_every_family() {
        let families = [
            HashId::Crc32,
            HashId::Ejb,
            HashId::Phong,
            HashId::Oz,
            HashId::Torek,
            HashId::Fnv,
            HashId::Stl,
            HashId::Md5,
            HashId::Sha1,
            HashId::Jenkins,
            HashId::Hsieh,
        ];
        for id in families {
            let a = hash_of(b"the quick brown fox", id);
            let b = hash_of(b"the quick brown fox", id);
            assert_eq!(a, b, "{id:?} is not deterministic");
        }
    }

    #[test]
    fn empty_key_does_not_panic() {
        for id in [HashId::Fnv, HashId::Crc32, HashId::Hsieh, HashId::Jenkins] {
            let _ = hash_of(b"", id);
        }
    }

    #[test]
    fn partition_of_wraps_into_range() {
        for hash in [0u32, 1, 1000, u32::MAX] {
            let p = partition_of(hash, 16);
            assert!(p < 16);
        }
    }

    #[test]
    fn default_hash_is_fnv() {
        assert_eq!(DEFAULT_HASH_ID, HashId::Fnv);
    }
}
