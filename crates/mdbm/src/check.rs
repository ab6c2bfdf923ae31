//! Integrity check and traversal: `check(level, verbose)` verifies the
//! database's on-disk invariants at increasing depth; `chunk_iterate`
//! and `iterate` expose the same traversal to external tooling.

use mdbm_directory::Directory;
use mdbm_storage::{ChunkHeader, ChunkStorage, ChunkType, FileHeader, FileStore, PageView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckLevel {
    Header = 0,
    Chunks = 1,
    Directory = 2,
    Data = 3,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub problems: Vec<String>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn fail(&mut self, verbose: bool, message: impl Into<String>) {
        let message = message.into();
        if verbose {
            tracing::warn!(%message, "check failure");
        }
        self.problems.push(message);
    }
}

/// Walk the chunk chain forward from page 1 (as `for_each_chunk` does),
/// recording each chunk's start page and length.
fn forward_walk(store: &FileStore) -> Vec<(u32, u32)> {
    let mut chunks = Vec::new();
    let _ = store.for_each_chunk(|page, header| chunks.push((page, header.length_pages)));
    chunks
}

/// A forward walk via `length` and a backward walk via `prev_length`
/// must visit the same chunks in reverse order.
fn check_chunk_chain(store: &FileStore, report: &mut CheckReport, verbose: bool) {
    let forward = forward_walk(store);
    let Some(&(last_start, _)) = forward.last() else {
        return;
    };

    let mut backward = Vec::new();
    let mut cursor = last_start;
    loop {
        let header = match store.chunk_header(cursor) {
            Ok(h) => h,
            Err(e) => {
                report.fail(verbose, format!("chunk header at page {cursor} unreadable: {e}"));
                return;
            }
        };
        backward.push((cursor, header.length_pages));
        if header.prev_length_pages == 0 {
            break;
        }
        if header.prev_length_pages > cursor {
            report.fail(verbose, format!("chunk at page {cursor} has prev_length_pages larger than its own start"));
            return;
        }
        cursor -= header.prev_length_pages;
    }
    backward.reverse();

    if backward != forward {
        report.fail(
            verbose,
            format!("forward/backward chunk walks disagree: forward={forward:?} backward={backward:?}"),
        );
    }
}

fn check_header(store: &FileStore, report: &mut CheckReport, verbose: bool) -> Option<FileHeader> {
    match FileHeader::decode(store.page_slice(0, 1)) {
        Ok(header) => Some(header),
        Err(e) => {
            report.fail(verbose, format!("header invalid: {e}"));
            None
        }
    }
}

fn check_directory(store: &FileStore, directory: &Directory, report: &mut CheckReport, verbose: bool) {
    for hash in (0..directory.depth() as u32 + 1).flat_map(|bits| 0..(1u32 << bits)) {
        let (_, page, _) = match directory.page_for_hash(hash) {
            Ok(r) => r,
            Err(e) => {
                report.fail(verbose, format!("directory lookup for probe hash {hash} failed: {e}"));
                continue;
            }
        };
        match store.chunk_header(page) {
            Ok(header) if header.chunk_type != ChunkType::Data => {
                report.fail(verbose, format!("directory leaf page {page} is not a DATA chunk"));
            }
            Err(e) => {
                report.fail(verbose, format!("directory leaf page {page} chunk header unreadable: {e}"));
            }
            _ => {}
        }
    }
}

fn check_data(store: &mut FileStore, report: &mut CheckReport, verbose: bool) {
    let data_chunks: Vec<(u32, u32)> = {
        let mut v = Vec::new();
        let _ = store.for_each_chunk(|page, header| {
            if header.chunk_type == ChunkType::Data {
                v.push((page, header.length_pages));
            }
        });
        v
    };
    for (page, _length) in data_chunks {
        let buf = store.page_slice_mut(page, 1);
        if let Err(e) = PageView::open(buf) {
            report.fail(verbose, format!("data page {page} header invalid: {e}"));
        }
    }
}

/// Verify invariants up to `level` and return a report; never panics on
/// corrupt input — `verbose` controls whether failures are also logged.
pub fn check(store: &mut FileStore, directory: Option<&Directory>, level: CheckLevel, verbose: bool) -> CheckReport {
    let mut report = CheckReport::default();

    if check_header(store, &mut report, verbose).is_none() {
        return report;
    }
    if level < CheckLevel::Chunks {
        return report;
    }

    check_chunk_chain(store, &mut report, verbose);
    if level < CheckLevel::Directory {
        return report;
    }

    if let Some(directory) = directory {
        check_directory(store, directory, &mut report, verbose);
    }
    if level < CheckLevel::Data {
        return report;
    }

    check_data(store, &mut report, verbose);
    report
}

/// Expose the chunk traversal to external tools.
pub fn chunk_iterate(store: &FileStore, mut visit: impl FnMut(u32, &ChunkHeader)) {
    let _ = store.for_each_chunk(|page, header| visit(page, header));
}

/// Expose a single page's entry traversal. `flags` is reserved for a
/// future skip-deleted filter and is currently unused.
pub fn iterate(store: &mut FileStore, page: u32, mut visit: impl FnMut(u32), _flags: u32) -> Result<(), mdbm_storage::StorageError> {
    let buf = store.page_slice_mut(page, 1);
    let view = PageView::open(buf)?;
    for slot_index in view.iterate_from(None) {
        visit(slot_index);
    }
    Ok(())
}
