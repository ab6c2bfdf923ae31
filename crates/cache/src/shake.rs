//! The legacy `shake` callback (pre-split eviction hook) and the
//! `clean_func` family that manages the CLEAN bit in cache mode.

use crate::policy::EntryMeta;

/// Passed to a `ShakeFunc` once per full data page, before MDBM would
/// otherwise choose to split it.
pub struct ShakeRequest<'a> {
    pub page: u32,
    pub needed_bytes: u32,
    pub entries: &'a [EntryMeta],
}

/// Returns the slot indices the callback is willing to have deleted; the
/// core removes them and retries the insert that triggered the shake.
pub trait ShakeFunc {
    fn shake(&mut self, request: &ShakeRequest) -> Vec<u32>;
}

impl<F: FnMut(&ShakeRequest) -> Vec<u32>> ShakeFunc for F {
    fn shake(&mut self, request: &ShakeRequest) -> Vec<u32> {
        self(request)
    }
}

/// What a `clean_func` invocation decides for one entry.
///
/// `quit` carries two meanings worth keeping distinct: "stop scanning
/// the current page" and "stop scanning entirely". Both are preserved
/// here rather than collapsed into one:
/// `clean_page` honors the narrower, single-page meaning; `clean_all`
/// honors both at once, by also ending its own outer loop over pages
/// whenever a page's scan was cut short.
#[derive(Debug, Clone, Copy)]
pub struct CleanDecision {
    pub mark_clean: bool,
    pub quit: bool,
}

pub trait CleanFunc {
    fn decide(&mut self, slot_index: u32, meta: &EntryMeta) -> CleanDecision;
}

impl<F: FnMut(u32, &EntryMeta) -> CleanDecision> CleanFunc for F {
    fn decide(&mut self, slot_index: u32, meta: &EntryMeta) -> CleanDecision {
        self(slot_index, meta)
    }
}

/// Scan one page's entries, returning the slot indices that should be
/// marked CLEAN. Stops early if the callback sets `quit`.
pub fn clean_page(entries: &[EntryMeta], clean_func: &mut dyn CleanFunc) -> Vec<u32> {
    let mut newly_clean = Vec::new();
    for meta in entries {
        let decision = clean_func.decide(meta.slot_index, meta);
        if decision.mark_clean {
            newly_clean.push(meta.slot_index);
        }
        if decision.quit {
            break;
        }
    }
    newly_clean
}

/// Scan every page, returning `(page, newly_clean_slots)` pairs. A `quit`
/// from the callback ends both the page it fired on and the scan of any
/// remaining pages.
pub fn clean_all(pages: &[(u32, Vec<EntryMeta>)], clean_func: &mut dyn CleanFunc) -> Vec<(u32, Vec<u32>)> {
    let mut result = Vec::new();
    for (page, entries) in pages {
        let mut newly_clean = Vec::new();
        let mut stopped_early = false;
        for meta in entries {
            let decision = clean_func.decide(meta.slot_index, meta);
            if decision.mark_clean {
                newly_clean.push(meta.slot_index);
            }
            if decision.quit {
                stopped_early = true;
                break;
            }
        }
        result.push((*page, newly_clean));
        if stopped_early {
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(slot_index: u32) -> EntryMeta {
        EntryMeta { slot_index, access_counter: 0, last_access: 0, size: 8, clean: false }
    }

    #[test]
    fn clean_page_marks_every_entry_the_callback_approves() {
        let entries = [meta(1), meta(2), meta(3)];
        let mut cleaned = clean_page(&entries, &mut |slot: u32, _: &EntryMeta| CleanDecision {
            mark_clean: slot != 2,
            quit: false,
        });
        cleaned.sort();
        assert_eq!(cleaned, vec![1, 3]);
    }

    #[test]
    fn clean_page_stops_scanning_on_quit_but_keeps_what_was_already_decided() {
        let entries = [meta(1), meta(2), meta(3)];
        let cleaned = clean_page(&entries, &mut |slot: u32, _: &EntryMeta| CleanDecision {
            mark_clean: true,
            quit: slot == 2,
        });
        assert_eq!(cleaned, vec![1, 2]);
    }

    #[test]
    fn clean_all_quit_stops_the_whole_scan_not_just_the_current_page() {
        let pages = vec![
            (10u32, vec![meta(1), meta(2)]),
            (20u32, vec![meta(3)]),
        ];
        let result = clean_all(&pages, &mut |slot: u32, _: &EntryMeta| CleanDecision {
            mark_clean: true,
            quit: slot == 2,
        });
        assert_eq!(result, vec![(10, vec![1, 2])]);
    }
}
