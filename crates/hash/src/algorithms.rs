//! Concrete hash function bodies. Each one takes the raw key bytes and
//! returns a 32-bit hash; none of them allocate.

/// Standard IEEE 802.3 CRC-32, built from a 256-entry table computed once.
pub fn crc32(key: &[u8]) -> u32 {
    static TABLE: [u32; 256] = build_crc32_table();

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in key {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// The `hsearch`-derived hash: classic djb2 (hash * 33 + byte).
pub fn ejb(key: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for &byte in key {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// A linear-congruential style hash, folding each byte through a fixed
/// multiplier/increment pair.
pub fn phong(key: &[u8]) -> u32 {
    const MULTIPLIER: u32 = 1_103_515_245;
    const INCREMENT: u32 = 12345;

    let mut hash = 0u32;
    for &byte in key {
        hash = hash
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT)
            .wrapping_add(byte as u32);
    }
    hash
}

/// The `sdbm` hash: `hash = byte + (hash << 6) + (hash << 16) - hash`.
pub fn oz(key: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in key {
        hash = (byte as u32)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash
}

/// A Berkeley-DB style rotating hash.
pub fn torek(key: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in key {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(byte as u32);
    }
    hash
}

/// FNV-1a, 32-bit variant. The default hash family.
pub fn fnv(key: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &byte in key {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A polynomial hash in the style of `std::hash` implementations found in
/// STL string hashers (base-31 rolling hash).
pub fn stl(key: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in key {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    hash
}

/// First 4 bytes of the MD5 digest, interpreted little-endian.
pub fn md5(key: &[u8]) -> u32 {
    use md5::{Digest, Md5};
    let digest = Md5::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// First 4 bytes of the SHA-1 digest, interpreted little-endian.
pub fn sha1(key: &[u8]) -> u32 {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Jenkins' "one-at-a-time" hash.
pub fn jenkins(key: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in key {
        hash = hash.wrapping_add(byte as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

/// Paul Hsieh's SuperFastHash.
pub fn hsieh(key: &[u8]) -> u32 {
    let len = key.len();
    if len == 0 {
        return 0;
    }

    let mut hash = len as u32;
    let mut chunks = key.chunks_exact(4);

    for chunk in &mut chunks {
        let a = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
        let b = u16::from_le_bytes([chunk[2], chunk[3]]) as u32;
        hash = hash.wrapping_add(a);
        let tmp = (b << 11).wrapping_sub(hash.rotate_left(16)) ^ (hash.wrapping_add(b << 11));
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let remainder = chunks.remainder();
    match remainder.len() {
        3 => {
            let a = u16::from_le_bytes([remainder[0], remainder[1]]) as u32;
            hash = hash.wrapping_add(a);
            hash ^= hash << 16;
            hash ^= (remainder[2] as u32) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            let a = u16::from_le_bytes([remainder[0], remainder[1]]) as u32;
            hash = hash.wrapping_add(a);
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(remainder[0] as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);

    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        // Standard test vector for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn fnv_matches_known_vector() {
        assert_eq!(fnv(b""), 0x811C_9DC5);
    }

    #[test]
    fn hsieh_handles_all_remainder_lengths() {
        for len in 0..9 {
            let key: Vec<u8> = (0..len).collect();
            let _ = hsieh(&key);
        }
    }
}
