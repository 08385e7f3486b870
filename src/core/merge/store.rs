// src/core/merge/store.rs

//! The data-structure side of a merge: the collaborator interface every
//! mergeable data structure implements, and the registry that routes incoming
//! entries to the owning instance and its resolved policy.

use super::config::DataStructureConfig;
use super::entry_view::MergingEntryView;
use super::policy::{MergePolicy, MergePolicyRegistry};
use crate::core::ClusterError;
use crate::core::metrics::MERGED_ENTRIES_TOTAL;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info};

/// A distributed data structure instance that can take part in a merge.
pub trait MergeableStore: Send + Sync + fmt::Debug {
    /// The instance name, matching the name on the destination cluster.
    fn name(&self) -> &str;

    /// Snapshots every locally held entry. Used on the merging side.
    fn local_entries(&self) -> Box<dyn Iterator<Item = MergingEntryView> + '_>;

    /// The currently stored entry for `key`, if any. Used on the surviving side.
    fn existing_entry(&self, key: &Bytes) -> Option<MergingEntryView>;

    /// Stores the reconciled value for `merging`'s key. `None` removes the key.
    ///
    /// When `value` is the incoming value, the store keeps `merging`'s
    /// metadata with it. Merge results are applied regardless of the
    /// `ClusterState`.
    fn apply_merge_result(&self, merging: &MergingEntryView, value: Option<Bytes>);

    /// Drops all local data. Called on the merging side after a successful merge.
    fn reset(&self);
}

/// What applying one incoming entry did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum MergeDecision {
    /// The key was absent and now holds the policy's value.
    Inserted,
    /// The key held a different value and now holds the policy's value.
    Replaced,
    /// The policy kept the existing value. No write happened.
    Kept,
    /// The policy removed the key.
    Removed,
    /// The key was absent and the policy produced nothing to store.
    Skipped,
}

/// Reconciles one incoming entry against `store` through `policy`.
pub fn merge_entry(
    store: &dyn MergeableStore,
    policy: &MergePolicy,
    merging: &MergingEntryView,
) -> MergeDecision {
    let existing = store.existing_entry(merging.key());
    let result = policy.merge(merging, existing.as_ref());

    let decision = match (&existing, &result) {
        (None, None) => MergeDecision::Skipped,
        (None, Some(_)) => MergeDecision::Inserted,
        (Some(_), None) => MergeDecision::Removed,
        (Some(existing), Some(value)) if existing.value() == value => MergeDecision::Kept,
        (Some(_), Some(_)) => MergeDecision::Replaced,
    };

    match decision {
        MergeDecision::Inserted | MergeDecision::Replaced | MergeDecision::Removed => {
            store.apply_merge_result(merging, result);
        }
        MergeDecision::Kept | MergeDecision::Skipped => {}
    }

    MERGED_ENTRIES_TOTAL
        .with_label_values(&[decision.as_ref()])
        .inc();
    decision
}

/// A data structure instance together with its resolved merge settings.
#[derive(Debug, Clone)]
pub struct RegisteredStore {
    pub store: Arc<dyn MergeableStore>,
    pub policy: MergePolicy,
    pub batch_size: usize,
}

/// All mergeable data structure instances of one member, keyed by name.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: DashMap<String, RegisteredStore>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        store: Arc<dyn MergeableStore>,
        policy: MergePolicy,
        batch_size: usize,
    ) -> Result<(), ClusterError> {
        let name = store.name().to_string();
        if self.stores.contains_key(&name) {
            return Err(ClusterError::DuplicateDataStructure(name));
        }
        info!(
            "Registered data structure '{}' with merge policy {} (batch size {}).",
            name,
            policy.name(),
            batch_size
        );
        self.stores.insert(
            name,
            RegisteredStore {
                store,
                policy,
                batch_size: batch_size.max(1),
            },
        );
        Ok(())
    }

    /// Registers `store` with the policy and batch size named in `config`.
    /// An unknown policy name fails here, at configuration time.
    pub fn register_configured(
        &self,
        store: Arc<dyn MergeableStore>,
        config: &DataStructureConfig,
        policies: &MergePolicyRegistry,
    ) -> Result<(), ClusterError> {
        let policy = policies.resolve(&config.merge_policy.policy)?;
        self.register(store, policy, config.merge_policy.batch_size)
    }

    pub fn get(&self, name: &str) -> Option<RegisteredStore> {
        self.stores.get(name).map(|entry| entry.value().clone())
    }

    /// Registered instance names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Applies one incoming batch to the named instance. Returns the number of
    /// entries processed, which is what the sender sees acknowledged.
    pub fn apply_batch(
        &self,
        structure: &str,
        entries: &[MergingEntryView],
    ) -> Result<usize, ClusterError> {
        let registered = self
            .get(structure)
            .ok_or_else(|| ClusterError::UnknownDataStructure(structure.to_string()))?;
        for entry in entries {
            let decision = merge_entry(registered.store.as_ref(), &registered.policy, entry);
            debug!("Merged key {:?} into '{}': {}", entry.key(), structure, decision);
        }
        Ok(entries.len())
    }

    /// Clears every registered instance.
    pub fn reset_all(&self) {
        for entry in self.stores.iter() {
            entry.value().store.reset();
            debug!("Reset data structure '{}'.", entry.key());
        }
    }
}
