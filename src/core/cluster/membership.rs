// src/core/cluster/membership.rs

//! Holds the authoritative member list of this member and publishes new
//! snapshots atomically.
//!
//! Readers never block: the current snapshot lives in an `ArcSwap` and is
//! replaced wholesale. Writers use optimistic concurrency; a publish only
//! succeeds if it is exactly one version ahead of the snapshot it replaces.

use super::member::{Address, Member};
use super::view::{ClusterIdentity, MembershipView};
use crate::core::ClusterError;
use crate::core::events::{EventBus, MembershipEvent};
use crate::core::metrics;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// A member that can no longer be reached but has not been removed yet.
#[derive(Debug, Clone, Serialize)]
pub struct MissingMemberRecord {
    pub address: Address,
    pub uuid: Uuid,
    /// Monotonic detection time, compared against the grace period.
    #[serde(skip)]
    pub detected_at: Instant,
    /// Wall-clock detection time, for administrative output.
    pub detected_at_wall: DateTime<Utc>,
}

/// The cluster identity and member list, swapped together so that readers
/// never see a view paired with the wrong cluster.
#[derive(Debug)]
pub struct ClusterSnapshot {
    pub cluster_id: ClusterIdentity,
    pub view: Arc<MembershipView>,
}

/// The membership view manager of one member.
#[derive(Debug)]
pub struct MembershipManager {
    local_uuid: Uuid,
    current: ArcSwap<ClusterSnapshot>,
    /// Missing-member records keyed by member UUID.
    missing: DashMap<Uuid, MissingMemberRecord>,
    events: Arc<EventBus>,
}

impl MembershipManager {
    /// Creates the manager of a freshly formed single-member cluster.
    pub fn new(local: Member, cluster_id: ClusterIdentity, events: Arc<EventBus>) -> Self {
        let local_uuid = local.uuid();
        let view = MembershipView::initial(local).localized(local_uuid);
        info!("Cluster {} formed.\n{}", cluster_id, view);
        let manager = Self {
            local_uuid,
            current: ArcSwap::from_pointee(ClusterSnapshot {
                cluster_id,
                view: Arc::new(view),
            }),
            missing: DashMap::new(),
            events,
        };
        manager.update_gauges();
        manager
    }

    /// Lock-free read of the latest published view.
    pub fn current(&self) -> Arc<MembershipView> {
        self.current.load().view.clone()
    }

    /// Lock-free read of the latest view together with its cluster identity.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.current.load_full()
    }

    pub fn cluster_id(&self) -> ClusterIdentity {
        self.current.load().cluster_id
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    pub fn local_member(&self) -> Member {
        self.current()
            .member(&self.local_uuid)
            .cloned()
            .expect("Invariant violation: the local member is always part of its own view")
    }

    pub fn master(&self) -> Option<Member> {
        self.current().master().cloned()
    }

    pub fn is_master(&self) -> bool {
        self.current()
            .master()
            .is_some_and(|m| m.uuid() == self.local_uuid)
    }

    pub fn member_list_version(&self) -> u64 {
        self.current().version()
    }

    /// The version at which the local member was admitted to the current view.
    ///
    /// This may change after assignment, as a merge re-admits the member into
    /// the destination cluster. It is always read from the latest view.
    pub fn member_list_join_version(&self) -> Option<u64> {
        self.current().join_version_of(&self.local_uuid)
    }

    pub fn lookup_by_uuid(&self, uuid: &Uuid) -> Option<Member> {
        self.current().member(uuid).cloned()
    }

    pub fn lookup_by_address(&self, address: &Address) -> Option<Member> {
        self.current().member_by_address(address).cloned()
    }

    /// Resolves a member only if address and UUID belong to the same record.
    pub fn lookup(&self, address: &Address, uuid: &Uuid) -> Option<Member> {
        self.current().member_by_identity(address, uuid).cloned()
    }

    /// Publishes `next` if it is exactly one version ahead of the current view.
    ///
    /// On a lost race this fails with `StaleVersion` and changes nothing; the
    /// caller recomputes from the latest view.
    pub fn publish(&self, next: MembershipView) -> Result<(), ClusterError> {
        let current = self.current.load_full();
        let expected = current.view.version() + 1;
        if next.version() != expected {
            return Err(ClusterError::StaleVersion {
                expected,
                actual: next.version(),
            });
        }
        self.swap_in(&current, next)
    }

    /// Publishes `next` at any version ahead of the current view.
    ///
    /// Used when admitting a member whose own member list is further along
    /// than this cluster's, so that its version does not move backwards when
    /// it adopts the admitting view.
    pub fn publish_at(&self, next: MembershipView) -> Result<(), ClusterError> {
        let current = self.current.load_full();
        if next.version() <= current.view.version() {
            return Err(ClusterError::StaleVersion {
                expected: current.view.version() + 1,
                actual: next.version(),
            });
        }
        self.swap_in(&current, next)
    }

    fn swap_in(
        &self,
        current: &Arc<ClusterSnapshot>,
        next: MembershipView,
    ) -> Result<(), ClusterError> {
        if !next.contains(&self.local_uuid) {
            return Err(ClusterError::MemberNotFound(self.local_uuid.to_string()));
        }

        let next = Arc::new(next.localized(self.local_uuid));
        let replacement = Arc::new(ClusterSnapshot {
            cluster_id: current.cluster_id,
            view: next.clone(),
        });
        let previous = self.current.compare_and_swap(current, replacement);
        if !Arc::ptr_eq(&*previous, current) {
            return Err(ClusterError::StaleVersion {
                expected: previous.view.version() + 1,
                actual: next.version(),
            });
        }

        self.after_swap(current.cluster_id, &current.view, next, false);
        Ok(())
    }

    /// Installs a view pushed by the master of the same cluster.
    ///
    /// Unlike `publish`, gaps are allowed (an update may have been missed), but
    /// the version must be strictly higher. Returns whether the view was installed.
    pub fn install(&self, cluster_id: ClusterIdentity, view: MembershipView) -> bool {
        loop {
            let current = self.current.load_full();
            if current.cluster_id != cluster_id
                || view.version() <= current.view.version()
                || !view.contains(&self.local_uuid)
            {
                debug!(
                    "Ignoring member list version {} for cluster {} (current: version {} of {}).",
                    view.version(),
                    cluster_id,
                    current.view.version(),
                    current.cluster_id
                );
                return false;
            }
            let next = Arc::new(view.localized(self.local_uuid));
            let replacement = Arc::new(ClusterSnapshot {
                cluster_id,
                view: next.clone(),
            });
            let previous = self.current.compare_and_swap(&current, replacement);
            if Arc::ptr_eq(&*previous, &current) {
                self.after_swap(cluster_id, &current.view, next, false);
                return true;
            }
        }
    }

    /// Replaces the cluster identity and view when this member joins a cluster.
    ///
    /// The adopted view must be ahead of the current one, so a reader never
    /// sees the version move backwards across a merge. Adopting the current
    /// version of the same cluster again is a no-op. Missing records of the
    /// old cluster are dropped.
    pub fn adopt(&self, cluster_id: ClusterIdentity, view: MembershipView) -> Result<(), ClusterError> {
        if !view.contains(&self.local_uuid) {
            return Err(ClusterError::MemberNotFound(self.local_uuid.to_string()));
        }
        loop {
            let current = self.current.load_full();
            if view.version() <= current.view.version() {
                if current.cluster_id == cluster_id && view.version() == current.view.version() {
                    return Ok(());
                }
                return Err(ClusterError::StaleVersion {
                    expected: current.view.version() + 1,
                    actual: view.version(),
                });
            }

            let next = Arc::new(view.localized(self.local_uuid));
            let replacement = Arc::new(ClusterSnapshot {
                cluster_id,
                view: next.clone(),
            });
            let previous = self.current.compare_and_swap(&current, replacement);
            if !Arc::ptr_eq(&*previous, &current) {
                continue;
            }

            self.missing.clear();
            info!(
                "Adopted cluster {} (was {}).\n{}",
                cluster_id, current.cluster_id, next
            );
            self.after_swap(cluster_id, &current.view, next, current.cluster_id != cluster_id);
            return Ok(());
        }
    }

    fn after_swap(
        &self,
        cluster_id: ClusterIdentity,
        previous: &MembershipView,
        next: Arc<MembershipView>,
        cluster_changed: bool,
    ) {
        let added: Vec<Member> = next
            .members()
            .filter(|m| !previous.contains(&m.uuid()))
            .cloned()
            .collect();
        let removed: Vec<Member> = previous
            .members()
            .filter(|m| !next.contains(&m.uuid()))
            .cloned()
            .collect();

        for member in &removed {
            if self.missing.remove(&member.uuid()).is_some() {
                debug!("Cleared missing record of removed member {}", member);
            }
        }

        if !cluster_changed {
            info!("Published member list.\n{}", next);
        }
        self.update_gauges();

        self.events.publish_membership(MembershipEvent {
            cluster_id,
            previous_version: previous.version(),
            view: next,
            added,
            removed,
            cluster_changed,
        });
    }

    /// Records `address`/`uuid` as missing. Returns `true` only when a new record
    /// was created; repeated signals for the same member keep the first record.
    pub fn mark_missing(&self, address: &Address, uuid: &Uuid, now: Instant) -> bool {
        if *uuid == self.local_uuid || self.lookup(address, uuid).is_none() {
            return false;
        }
        let mut created = false;
        self.missing.entry(*uuid).or_insert_with(|| {
            created = true;
            MissingMemberRecord {
                address: address.clone(),
                uuid: *uuid,
                detected_at: now,
                detected_at_wall: Utc::now(),
            }
        });
        if created {
            self.update_gauges();
        }
        created
    }

    pub fn clear_missing(&self, uuid: &Uuid) -> Option<MissingMemberRecord> {
        let removed = self.missing.remove(uuid).map(|(_, record)| record);
        if removed.is_some() {
            self.update_gauges();
        }
        removed
    }

    /// True while an uncleared missing record exists for exactly this identity.
    pub fn is_missing_member(&self, address: &Address, uuid: &Uuid) -> bool {
        self.missing
            .get(uuid)
            .is_some_and(|record| record.address == *address)
    }

    pub fn missing_members(&self) -> Vec<MissingMemberRecord> {
        self.missing.iter().map(|e| e.value().clone()).collect()
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe_membership()
    }

    fn update_gauges(&self) {
        let view = self.current();
        metrics::MEMBER_COUNT.set(view.size() as f64);
        metrics::MEMBER_LIST_VERSION.set(view.version() as f64);
        metrics::MISSING_MEMBERS.set(self.missing.len() as f64);
    }
}
