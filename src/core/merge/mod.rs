// src/core/merge/mod.rs

//! Per-entry conflict resolution for split-brain merges: the entry view
//! exchanged between clusters, the policies that reconcile it, and the
//! registry of data structures that take part.

pub mod config;
pub mod entry_view;
pub mod policy;
pub mod store;

pub use config::{DataStructureConfig, MergePolicyConfig};
pub use entry_view::{MergingEntryView, NEVER_EXPIRES};
pub use policy::{BuiltinPolicy, CustomMergePolicy, MergePolicy, MergePolicyRegistry};
pub use store::{MergeDecision, MergeableStore, RegisteredStore, StoreRegistry, merge_entry};
