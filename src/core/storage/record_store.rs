// src/core/storage/record_store.rs

//! A concurrent in-memory key/value store that tracks the per-entry statistics
//! merge policies consult. It stands in for a replicated map.

use super::now_ms;
use crate::core::ClusterError;
use crate::core::cluster::state::ClusterStateHolder;
use crate::core::merge::{MergeableStore, MergingEntryView, NEVER_EXPIRES};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A stored value with its metadata.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub value: Bytes,
    /// Incremented on every update of the key.
    pub version: u64,
    pub hits: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_update_time: u64,
    /// Time-to-live in milliseconds. Zero means no TTL.
    pub ttl: u64,
    /// Maximum idle time in milliseconds. Zero means unbounded.
    pub max_idle: u64,
    pub expiration_time: u64,
    pub last_stored_time: u64,
}

impl StoredRecord {
    fn new(value: Bytes, now: u64) -> Self {
        Self {
            value,
            version: 1,
            hits: 0,
            creation_time: now,
            last_access_time: now,
            last_update_time: now,
            ttl: 0,
            max_idle: 0,
            expiration_time: NEVER_EXPIRES,
            last_stored_time: 0,
        }
    }

    fn update(&mut self, value: Bytes, now: u64) {
        self.value = value;
        self.version += 1;
        self.last_update_time = now;
        self.expiration_time = match self.ttl {
            0 => NEVER_EXPIRES,
            ttl => now.saturating_add(ttl),
        };
    }

    fn is_expired(&self, now: u64) -> bool {
        if self.expiration_time <= now {
            return true;
        }
        self.max_idle > 0 && self.last_access_time.saturating_add(self.max_idle) <= now
    }

    /// Estimated footprint of the record in bytes.
    fn cost(&self, key: &Bytes) -> u64 {
        (key.len() + self.value.len() + std::mem::size_of::<Self>()) as u64
    }

    fn to_entry_view(&self, key: &Bytes) -> MergingEntryView {
        MergingEntryView::new(key.clone(), self.value.clone())
            .with_cost(self.cost(key))
            .with_version(self.version)
            .with_hits(self.hits)
            .with_creation_time(self.creation_time)
            .with_last_access_time(self.last_access_time)
            .with_last_update_time(self.last_update_time)
            .with_ttl(self.ttl)
            .with_max_idle(self.max_idle)
            .with_expiration_time(self.expiration_time)
            .with_last_stored_time(self.last_stored_time)
    }

    fn from_entry_view(view: &MergingEntryView) -> Self {
        Self {
            value: view.value().clone(),
            version: view.version(),
            hits: view.hits(),
            creation_time: view.creation_time(),
            last_access_time: view.last_access_time(),
            last_update_time: view.last_update_time(),
            ttl: view.ttl(),
            max_idle: view.max_idle(),
            expiration_time: view.expiration_time(),
            last_stored_time: view.last_stored_time(),
        }
    }
}

/// A named key/value store whose writes are gated by the shared `ClusterState`.
#[derive(Debug)]
pub struct RecordStore {
    name: String,
    records: DashMap<Bytes, StoredRecord>,
    cluster_state: Arc<ClusterStateHolder>,
}

impl RecordStore {
    pub fn new(name: impl Into<String>, cluster_state: Arc<ClusterStateHolder>) -> Self {
        Self {
            name: name.into(),
            records: DashMap::new(),
            cluster_state,
        }
    }

    fn check_writable(&self) -> Result<(), ClusterError> {
        let state = self.cluster_state.get();
        if state.allows_mutation() {
            Ok(())
        } else {
            Err(ClusterError::ClusterStateForbidsMutation(state))
        }
    }

    /// Stores `value` under `key` and returns the previous value.
    pub fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, ClusterError> {
        self.put_inner(key.into(), value.into(), None)
    }

    /// Stores `value` under `key` with a time-to-live.
    pub fn put_with_ttl(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<Option<Bytes>, ClusterError> {
        self.put_inner(key.into(), value.into(), Some(ttl))
    }

    fn put_inner(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<Option<Bytes>, ClusterError> {
        self.check_writable()?;
        let now = now_ms();
        let mut previous = None;
        let mut record = self
            .records
            .entry(key)
            .and_modify(|record| {
                if record.is_expired(now) {
                    *record = StoredRecord::new(Bytes::new(), now);
                    record.version = 0;
                } else {
                    previous = Some(record.value.clone());
                }
            })
            .or_insert_with(|| {
                let mut record = StoredRecord::new(Bytes::new(), now);
                record.version = 0;
                record
            });
        if let Some(ttl) = ttl {
            record.ttl = ttl.as_millis() as u64;
        }
        record.update(value, now);
        Ok(previous)
    }

    /// Reads a value, counting the access.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = now_ms();
        let mut record = self.records.get_mut(key)?;
        if record.is_expired(now) {
            drop(record);
            self.records.remove_if(key, |_, r| r.is_expired(now));
            return None;
        }
        record.hits += 1;
        record.last_access_time = now;
        Some(record.value.clone())
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>, ClusterError> {
        self.check_writable()?;
        let now = now_ms();
        Ok(self
            .records
            .remove(key)
            .filter(|(_, record)| !record.is_expired(now))
            .map(|(_, record)| record.value))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let now = now_ms();
        self.records
            .get(key)
            .is_some_and(|record| !record.is_expired(now))
    }

    /// The metadata-bearing view of one entry. Does not count as an access.
    pub fn entry_view(&self, key: &[u8]) -> Option<MergingEntryView> {
        let now = now_ms();
        self.records
            .get(key)
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().to_entry_view(entry.key()))
    }

    /// Stores an entry with all of its metadata, for example when loading a snapshot.
    pub fn insert_view(&self, view: &MergingEntryView) -> Result<(), ClusterError> {
        self.check_writable()?;
        self.records
            .insert(view.key().clone(), StoredRecord::from_entry_view(view));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl MergeableStore for RecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_entries(&self) -> Box<dyn Iterator<Item = MergingEntryView> + '_> {
        let now = now_ms();
        Box::new(
            self.records
                .iter()
                .filter(move |entry| !entry.value().is_expired(now))
                .map(|entry| entry.value().to_entry_view(entry.key())),
        )
    }

    fn existing_entry(&self, key: &Bytes) -> Option<MergingEntryView> {
        self.entry_view(key)
    }

    fn apply_merge_result(&self, merging: &MergingEntryView, value: Option<Bytes>) {
        let key = merging.key();
        let now = now_ms();
        match value {
            Some(value) if value == *merging.value() => {
                let mut record = StoredRecord::from_entry_view(merging);
                if let Some(existing) = self.records.get(key) {
                    record.version = existing.version.max(merging.version()) + 1;
                }
                self.records.insert(key.clone(), record);
            }
            Some(value) => {
                self.records
                    .entry(key.clone())
                    .and_modify(|record| record.update(value.clone(), now))
                    .or_insert_with(|| StoredRecord::new(value, now));
            }
            None => {
                self.records.remove(key);
            }
        }
    }

    fn reset(&self) {
        self.records.clear();
    }
}
