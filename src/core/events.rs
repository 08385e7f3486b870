// src/core/events.rs

//! Defines the events published by the membership manager and the merge
//! orchestrator, and the broadcast bus that carries them to subscribers.

use crate::core::cluster::member::Member;
use crate::core::cluster::view::{ClusterIdentity, MembershipView};
use std::sync::Arc;
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel for membership changes.
/// Slow subscribers lag and must re-read the current view.
const MEMBERSHIP_BUS_CAPACITY: usize = 1024;

/// The capacity of the broadcast channel for merge lifecycle events.
const LIFECYCLE_BUS_CAPACITY: usize = 256;

/// Emitted after every successful publication of a new member list.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub cluster_id: ClusterIdentity,
    /// Version of the view that was replaced.
    pub previous_version: u64,
    pub view: Arc<MembershipView>,
    pub added: Vec<Member>,
    pub removed: Vec<Member>,
    /// `true` when the member adopted a different cluster (after a merge or join).
    /// The adopted view still has a higher version than the one it replaced.
    pub cluster_changed: bool,
}

/// Merge lifecycle notifications for administrative tooling and health endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    MergingStarted {
        local_cluster_id: ClusterIdentity,
        remote_cluster_id: ClusterIdentity,
    },
    Merged {
        previous_cluster_id: ClusterIdentity,
        cluster_id: ClusterIdentity,
    },
    MergeFailed {
        cluster_id: ClusterIdentity,
        reason: String,
    },
}

/// Central distribution hub for membership and lifecycle events.
#[derive(Debug)]
pub struct EventBus {
    membership_sender: BroadcastSender<MembershipEvent>,
    lifecycle_sender: BroadcastSender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (membership_sender, _) = broadcast::channel(MEMBERSHIP_BUS_CAPACITY);
        let (lifecycle_sender, _) = broadcast::channel(LIFECYCLE_BUS_CAPACITY);
        Self {
            membership_sender,
            lifecycle_sender,
        }
    }

    pub fn publish_membership(&self, event: MembershipEvent) {
        // It's okay if there are no active subscribers.
        if self.membership_sender.send(event).is_err() {
            debug!("Published a membership event with no active subscribers.");
        }
    }

    pub fn publish_lifecycle(&self, event: LifecycleEvent) {
        if self.lifecycle_sender.send(event).is_err() {
            debug!("Published a lifecycle event with no active subscribers.");
        }
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_sender.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_sender.subscribe()
    }
}
