//! Process-wide logging init. `MDBM_LOG_DEST` selects a sink
//! (`stderr`, `file`, `syslog`); `MDBM_LOG_DEST_NAME` gives the file path
//! for `file`. There is no `syslog` crate in this workspace's
//! dependency stack, so that destination logs a one-time warning and
//! falls back to stderr rather than silently dropping lines.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the global `tracing` subscriber. Idempotent: subsequent
/// calls (e.g. from multiple `Mdbm::open` calls in one process) are
/// no-ops.
pub fn init() {
    INIT.call_once(|| {
        let dest = std::env::var("MDBM_LOG_DEST").unwrap_or_else(|_| "stderr".to_string());
        match dest.as_str() {
            "file" => {
                let path = std::env::var("MDBM_LOG_DEST_NAME").unwrap_or_else(|_| "mdbm.log".to_string());
                match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => {
                        let _ = tracing_subscriber::fmt().with_writer(std::sync::Mutex::new(file)).try_init();
                    }
                    Err(e) => {
                        let _ = tracing_subscriber::fmt().try_init();
                        tracing::warn!(path, error = %e, "could not open MDBM_LOG_DEST_NAME, logging to stderr instead");
                    }
                }
            }
            "syslog" => {
                let _ = tracing_subscriber::fmt().try_init();
                tracing::warn!("MDBM_LOG_DEST=syslog is not wired to a syslog sink in this build; logging to stderr");
            }
            _ => {
                let _ = tracing_subscriber::fmt().try_init();
            }
        }
    });
}
