//! `MdbmConfig`: every open-time choice in the flag namespace, collected
//! into one `serde`-deserializable struct so a deployment can pin its
//! parameters in a YAML file instead of scattering flag constants through
//! source.

use serde::{Deserialize, Serialize};

use crate::error::MdbmResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockModeConfig {
    None,
    Exclusive,
    Partitioned,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MdbmConfig {
    pub page_size: u32,
    pub alignment: u8,
    pub hash_id: u8,
    pub dir_min_shift: u8,
    pub dir_max_shift: u8,
    pub large_objects_enabled: bool,
    pub spill_size: u32,
    pub limit_pages: u32,
    pub cache_mode: u8,
    pub evict_clean_first: bool,
    pub partition_count: u32,
    pub lock_mode: LockModeConfig,
    pub stats_enabled: bool,
    /// Windowed-mode slot-table size in bytes; 0 disables windowed mode
    /// even if `OpenFlags::OPEN_WINDOWED` is passed to `open`. Must be at
    /// least `2 * page_size` and a multiple of the system page size when
    /// non-zero (see `mdbm::window::validate_window_size`).
    pub window_size: u32,
    /// Pre-create this many data chunks (rounded up to a power of two,
    /// capped by `dir_max_shift`) at creation time, before any data
    /// exists, instead of growing the directory lazily on first splits.
    /// 1 (the default) leaves the freshly created database with just its
    /// single seeded root leaf.
    pub pre_split_pages: u32,
}

impl Default for MdbmConfig {
    fn default() -> Self {
        MdbmConfig {
            page_size: 4096,
            alignment: 8,
            hash_id: mdbm_hash::DEFAULT_HASH_ID as u8,
            dir_min_shift: 0,
            dir_max_shift: 20,
            large_objects_enabled: true,
            spill_size: 3072,
            limit_pages: 0,
            cache_mode: 0,
            evict_clean_first: false,
            partition_count: 0,
            lock_mode: LockModeConfig::Exclusive,
            stats_enabled: true,
            window_size: 0,
            pre_split_pages: 1,
        }
    }
}

impl MdbmConfig {
    pub fn from_yaml_str(yaml: &str) -> MdbmResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::MdbmError::Invalid(format!("bad config yaml: {e}")))
    }

    pub fn to_yaml_string(&self) -> MdbmResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| crate::error::MdbmError::Invalid(format!("cannot serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let config = MdbmConfig::default();
        let yaml = config.to_yaml_string().unwrap();
        let restored = MdbmConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(restored.page_size, config.page_size);
        assert_eq!(restored.lock_mode, config.lock_mode);
    }

    #[test]
    fn bad_yaml_is_reported_as_invalid() {
        assert!(MdbmConfig::from_yaml_str("not: [valid, config").is_err());
    }
}
