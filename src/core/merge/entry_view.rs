// src/core/merge/entry_view.rs

//! The metadata-bearing snapshot of one stored entry exchanged during a merge.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Expiration time of an entry that never expires.
pub const NEVER_EXPIRES: u64 = u64::MAX;

/// A key/value pair plus the statistics a merge policy may consult.
///
/// Built fresh from the owning data structure's record for every merge and
/// never mutated after it is handed to a policy: a policy returns a new value
/// (or `None` for removal) instead of editing the view.
///
/// All timestamps are milliseconds since the UNIX epoch; durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergingEntryView {
    key: Bytes,
    value: Bytes,
    cost: u64,
    version: u64,
    hits: u64,
    last_access_time: u64,
    last_update_time: u64,
    ttl: u64,
    max_idle: u64,
    creation_time: u64,
    expiration_time: u64,
    last_stored_time: u64,
}

impl MergingEntryView {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        let key = key.into();
        let value = value.into();
        Self {
            cost: (key.len() + value.len()) as u64,
            key,
            value,
            version: 0,
            hits: 0,
            last_access_time: 0,
            last_update_time: 0,
            ttl: 0,
            max_idle: 0,
            creation_time: 0,
            expiration_time: NEVER_EXPIRES,
            last_stored_time: 0,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_last_access_time(mut self, last_access_time: u64) -> Self {
        self.last_access_time = last_access_time;
        self
    }

    pub fn with_last_update_time(mut self, last_update_time: u64) -> Self {
        self.last_update_time = last_update_time;
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_idle(mut self, max_idle: u64) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_creation_time(mut self, creation_time: u64) -> Self {
        self.creation_time = creation_time;
        self
    }

    pub fn with_expiration_time(mut self, expiration_time: u64) -> Self {
        self.expiration_time = expiration_time;
        self
    }

    pub fn with_last_stored_time(mut self, last_stored_time: u64) -> Self {
        self.last_stored_time = last_stored_time;
        self
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Estimated memory footprint in bytes.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn max_idle(&self) -> u64 {
        self.max_idle
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn expiration_time(&self) -> u64 {
        self.expiration_time
    }

    pub fn last_stored_time(&self) -> u64 {
        self.last_stored_time
    }
}
