//! The `open`/`store` flag namespaces, with numeric values carried
//! over from `original_source/include/mdbm.h` so a config file or a log
//! line showing the raw bits still matches the upstream tool's output.

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
        impl Default for $name {
            fn default() -> Self { Self::empty() }
        }
    };
}

bitflags_like! {
    /// Mirrors the numeric values of `MDBM_O_*` / `MDBM_OPEN_*` /
    /// `MDBM_*_LOCKS`.
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0000_0000;
        const RDWR = 0x0000_0002;
        const CREAT = 0x0000_0200;
        const TRUNC = 0x0000_0400;
        const FSYNC = 0x0000_0080;
        const ASYNC = 0x0000_0040;
        const DIRECT = 0x0000_4000;
        const NO_DIRTY = 0x0001_0000;
        const SINGLE_ARCH = 0x0008_0000;
        const OPEN_WINDOWED = 0x0010_0000;
        const PROTECT = 0x0020_0000;
        const DBSIZE_MB = 0x0040_0000;
        const STAT_OPERATIONS = 0x0080_0000;
        const LARGE_OBJECTS = 0x0100_0000;
        const PARTITIONED_LOCKS = 0x0200_0000;
        const RW_LOCKS = 0x0800_0000;
        const ANY_LOCKS = 0x0002_0000;
        const CREATE_V3 = 0x2000_0000;
        const OPEN_NOLOCK = 0x8000_0000;
    }
}

/// `MDBM_INSERT` / `MDBM_REPLACE` / `MDBM_INSERT_DUP` / `MDBM_MODIFY`:
/// these occupy `MDBM_STORE_MASK` (0x3), a separate sub-namespace from
/// the modifier bits in `StoreFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreMode {
    Insert = 0,
    Replace = 1,
    InsertDup = 2,
    Modify = 3,
}

bitflags_like! {
    /// `MDBM_RESERVE` / `MDBM_CLEAN` / `MDBM_CACHE_ONLY` / `MDBM_CACHE_MODIFY`.
    pub struct StoreFlags: u32 {
        const RESERVE = 0x100;
        const CLEAN = 0x200;
        const CACHE_ONLY = 0x400;
        const CACHE_MODIFY = 0x1000;
    }
}

/// `MDBM_STORE_SUCCESS` (0) / `MDBM_STORE_ENTRY_EXISTS` (1).
pub const STORE_ENTRY_EXISTS: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchIntent {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_match_the_original_numeric_values() {
        assert_eq!(OpenFlags::OPEN_WINDOWED.bits(), 0x0010_0000);
        assert_eq!(OpenFlags::DBSIZE_MB.bits(), 0x0040_0000);
        assert_eq!(OpenFlags::PARTITIONED_LOCKS.bits(), 0x0200_0000);
        assert_eq!(OpenFlags::RW_LOCKS.bits(), 0x0800_0000);
        assert_eq!(OpenFlags::CREATE_V3.bits(), 0x2000_0000);
        assert_eq!(OpenFlags::OPEN_NOLOCK.bits(), 0x8000_0000);
    }

    #[test]
    fn open_flags_combine_with_bitor_and_contains() {
        let combined = OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::PARTITIONED_LOCKS;
        assert!(combined.contains(OpenFlags::RDWR));
        assert!(combined.contains(OpenFlags::PARTITIONED_LOCKS));
        assert!(!combined.contains(OpenFlags::OPEN_NOLOCK));
    }

    #[test]
    fn store_mode_discriminants_match_the_original() {
        assert_eq!(StoreMode::Insert as u8, 0);
        assert_eq!(StoreMode::Replace as u8, 1);
        assert_eq!(StoreMode::InsertDup as u8, 2);
        assert_eq!(StoreMode::Modify as u8, 3);
    }
}
