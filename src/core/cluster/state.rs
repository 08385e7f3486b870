// src/core/cluster/state.rs

//! The cluster-wide operating mode that gates migrations and mutating operations.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::info;

/// Governs whether partition migrations and mutating operations are permitted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    #[default]
    Active,
    /// No mutations, no migrations. Forced by the merge orchestrator during a merge.
    Frozen,
    /// Read-only; the cluster is shutting down or being maintained.
    Passive,
    /// Mutations are allowed but partitions do not migrate.
    NoMigration,
    /// A cluster-wide state change is being applied.
    InTransition,
}

impl ClusterState {
    pub fn allows_mutation(self) -> bool {
        matches!(self, ClusterState::Active | ClusterState::NoMigration)
    }

    pub fn allows_migration(self) -> bool {
        matches!(self, ClusterState::Active)
    }
}

/// Shared holder for the local member's `ClusterState`.
///
/// Data structures read it on every write; only the cluster management
/// context changes it.
#[derive(Debug, Default)]
pub struct ClusterStateHolder {
    state: RwLock<ClusterState>,
}

impl ClusterStateHolder {
    pub fn new(initial: ClusterState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> ClusterState {
        *self.state.read()
    }

    /// Replaces the state and returns the previous one.
    pub fn set(&self, next: ClusterState) -> ClusterState {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous != next {
            info!("Cluster state changed from {} to {}", previous, next);
        }
        *guard = next;
        previous
    }

    pub fn allows_mutation(&self) -> bool {
        self.get().allows_mutation()
    }
}
