// src/core/storage/mod.rs

use std::time::{SystemTime, UNIX_EPOCH};

pub mod record_store;

pub use record_store::{RecordStore, StoredRecord};

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
