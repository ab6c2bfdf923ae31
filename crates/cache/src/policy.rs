//! Cache-mode eviction policy: LRU / LFU / GDSF victim selection
//! over a full page's entries, with an optional "evict clean entries
//! first" preference.

use crate::error::{CacheError, CacheResult};

/// The `EVICT_CLEAN_FIRST` modifier bit in the open-time flag namespace;
/// `FileHeader::evict_clean_first` in `mdbm-storage` already decodes it
/// to a `bool`, this constant documents where that bit lives.
pub const EVICT_CLEAN_FIRST_BIT: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheMode {
    None = 0,
    Lfu = 1,
    Lru = 2,
    Gdsf = 3,
}

impl CacheMode {
    pub fn from_u8(value: u8) -> CacheResult<Self> {
        match value {
            0 => Ok(CacheMode::None),
            1 => Ok(CacheMode::Lfu),
            2 => Ok(CacheMode::Lru),
            3 => Ok(CacheMode::Gdsf),
            other => Err(CacheError::UnknownCacheMode(other)),
        }
    }
}

/// Per-entry bookkeeping the eviction policy scores against: every entry
/// carries an access counter and a last-access time, both advanced on
/// fetch.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub slot_index: u32,
    pub access_counter: u32,
    pub last_access: u64,
    pub size: u32,
    pub clean: bool,
}

/// Simplified GDSF score: frequency-over-size plus a running inflation
/// term that the caller carries across evictions so a page's relative
/// cost ordering ages forward, matching the classic Greedy-Dual-Size
/// algorithm's aging floor. Lower score evicts first, same as LRU/LFU.
fn score(mode: CacheMode, meta: &EntryMeta, gdsf_inflation: f64) -> f64 {
    match mode {
        CacheMode::None => f64::INFINITY,
        CacheMode::Lru => meta.last_access as f64,
        CacheMode::Lfu => meta.access_counter as f64,
        CacheMode::Gdsf => gdsf_inflation + (meta.access_counter as f64 / meta.size.max(1) as f64),
    }
}

/// Choose the slot to evict from `candidates`. Ties break on the lowest
/// slot index. Returns `None` only if `candidates` is empty.
pub fn pick_victim(
    mode: CacheMode,
    evict_clean_first: bool,
    gdsf_inflation: f64,
    candidates: &[EntryMeta],
) -> Option<u32> {
    let clean_only: Vec<&EntryMeta> = candidates.iter().filter(|c| c.clean).collect();
    let pool: Vec<&EntryMeta> = if evict_clean_first && !clean_only.is_empty() {
        clean_only
    } else {
        candidates.iter().collect()
    };

    let mut best: Option<(f64, u32)> = None;
    for meta in pool {
        let s = score(mode, meta, gdsf_inflation);
        best = match best {
            None => Some((s, meta.slot_index)),
            Some((best_score, best_idx)) => {
                if s < best_score || (s == best_score && meta.slot_index < best_idx) {
                    Some((s, meta.slot_index))
                } else {
                    Some((best_score, best_idx))
                }
            }
        };
    }
    best.map(|(_, idx)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(slot_index: u32, access_counter: u32, last_access: u64, size: u32, clean: bool) -> EntryMeta {
        EntryMeta { slot_index, access_counter, last_access, size, clean }
    }

    #[test]
    fn lru_picks_the_least_recently_accessed() {
        let candidates = [
            meta(1, 0, 100, 10, false),
            meta(2, 0, 20, 10, false),
            meta(3, 0, 50, 10, false),
        ];
        assert_eq!(pick_victim(CacheMode::Lru, false, 0.0, &candidates), Some(2));
    }

    #[test]
    fn lfu_picks_the_least_frequently_accessed() {
        let candidates = [
            meta(1, 9, 0, 10, false),
            meta(2, 1, 0, 10, false),
            meta(3, 5, 0, 10, false),
        ];
        assert_eq!(pick_victim(CacheMode::Lfu, false, 0.0, &candidates), Some(2));
    }

    #[test]
    fn ties_break_on_lowest_slot_index() {
        let candidates = [meta(5, 3, 0, 10, false), meta(2, 3, 0, 10, false)];
        assert_eq!(pick_victim(CacheMode::Lfu, false, 0.0, &candidates), Some(2));
    }

    #[test]
    fn evict_clean_first_prefers_clean_entries_even_if_dirty_scores_lower() {
        let candidates = [meta(1, 0, 0, 10, false), meta(2, 100, 0, 10, true)];
        assert_eq!(pick_victim(CacheMode::Lfu, true, 0.0, &candidates), Some(2));
    }

    #[test]
    fn evict_clean_first_falls_back_to_all_entries_when_none_are_clean() {
        let candidates = [meta(1, 5, 0, 10, false), meta(2, 1, 0, 10, false)];
        assert_eq!(pick_victim(CacheMode::Lfu, true, 0.0, &candidates), Some(2));
    }

    #[test]
    fn empty_candidates_has_no_victim() {
        assert_eq!(pick_victim(CacheMode::Lru, false, 0.0, &[]), None);
    }

    #[test]
    fn cache_mode_from_u8_matches_persisted_values() {
        assert_eq!(CacheMode::from_u8(0).unwrap(), CacheMode::None);
        assert_eq!(CacheMode::from_u8(3).unwrap(), CacheMode::Gdsf);
        assert!(CacheMode::from_u8(4).is_err());
    }
}
