// src/core/cluster/detector.rs

//! Classifies members as reachable, missing, or part of another cluster.
//!
//! The detector performs no I/O. Liveness arrives as transport events
//! (`on_member_unreachable`, `on_member_reconnected`), and missing members are
//! removed once the configured grace period elapses. Split-brain detection is
//! edge-triggered: it fires when a reconnect reveals a member of a different
//! `ClusterIdentity`, or a member of the same identity whose member list and
//! the local one have excluded each other.

use super::member::{Address, Member};
use super::membership::MembershipManager;
use super::view::{ClusterIdentity, MembershipView};
use crate::core::ClusterError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One side of a merge. Sub-clusters left behind by a partition share their
/// identity and are told apart by their masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeSide {
    pub cluster_id: ClusterIdentity,
    pub master: Option<Uuid>,
}

impl MergeSide {
    pub fn of(cluster_id: ClusterIdentity, view: &MembershipView) -> Self {
        Self {
            cluster_id,
            master: view.master().map(Member::uuid),
        }
    }
}

/// Identifies a merge between two clusters, independent of which side observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergePair {
    low: MergeSide,
    high: MergeSide,
}

impl MergePair {
    pub fn new(a: MergeSide, b: MergeSide) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn involves(&self, cluster_id: ClusterIdentity) -> bool {
        self.low.cluster_id == cluster_id || self.high.cluster_id == cluster_id
    }
}

/// Two independently operating clusters became reachable to each other.
#[derive(Debug, Clone)]
pub struct SplitBrainDetected {
    pub local_cluster_id: ClusterIdentity,
    pub local_view: Arc<MembershipView>,
    pub remote_cluster_id: ClusterIdentity,
    pub remote_view: Arc<MembershipView>,
    /// The reconnected member through which the other cluster was seen.
    pub remote_address: Address,
}

impl SplitBrainDetected {
    pub fn pair(&self) -> MergePair {
        MergePair::new(
            MergeSide::of(self.local_cluster_id, &self.local_view),
            MergeSide::of(self.remote_cluster_id, &self.remote_view),
        )
    }
}

/// What a reconnect signal turned out to mean.
#[derive(Debug, Clone)]
pub enum ReconnectOutcome {
    /// Same cluster, reconnected within the grace period. The missing record was cleared.
    Recovered,
    /// Same cluster, nothing was pending for this member.
    Ignored,
    /// The remote member no longer lists this member, but this side still
    /// lists it. It is kept missing and classified again once it is removed.
    Deferred,
    /// The remote member belongs to another cluster or sub-cluster.
    SplitBrain(SplitBrainDetected),
}

/// A reconnect waiting for the local member list to drop the remote member.
#[derive(Debug, Clone)]
pub struct DeferredReconnect {
    pub address: Address,
    pub uuid: Uuid,
    pub cluster_id: ClusterIdentity,
    pub view: MembershipView,
}

#[derive(Debug)]
pub struct SplitBrainDetector {
    membership: Arc<MembershipManager>,
    grace_period: Duration,
    deferred: DashMap<Uuid, DeferredReconnect>,
}

impl SplitBrainDetector {
    pub fn new(membership: Arc<MembershipManager>, grace_period: Duration) -> Self {
        Self {
            membership,
            grace_period,
            deferred: DashMap::new(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Handles a transport failure signal. Returns `true` if a new missing
    /// record was created; repeats of the same signal are no-ops.
    pub fn on_member_unreachable(&self, address: &Address, uuid: &Uuid, now: Instant) -> bool {
        let created = self.membership.mark_missing(address, uuid, now);
        if created {
            warn!(
                "Member {} ({}) is unreachable. Removing it in {:?} unless it reconnects.",
                address, uuid, self.grace_period
            );
        } else {
            debug!("Ignoring repeated or unknown unreachable signal for {} ({}).", address, uuid);
        }
        created
    }

    /// Handles a transport reconnect signal carrying the remote side's identity and view.
    pub fn on_member_reconnected(
        &self,
        address: &Address,
        uuid: &Uuid,
        remote_cluster_id: ClusterIdentity,
        remote_view: MembershipView,
    ) -> ReconnectOutcome {
        let snapshot = self.membership.snapshot();

        if remote_view.contains(&self.membership.local_uuid()) {
            self.deferred.remove(uuid);
            if remote_cluster_id != snapshot.cluster_id {
                // The other side still lists us: it has not completed its own split.
                debug!(
                    "Reconnected member {} reports cluster {} but still lists this member. Ignoring.",
                    address, remote_cluster_id
                );
                return ReconnectOutcome::Ignored;
            }
            return match self.membership.clear_missing(uuid) {
                Some(record) => {
                    info!(
                        "Member {} ({}) reconnected after {:?}. Treating it as a transient network blip.",
                        address,
                        uuid,
                        record.detected_at.elapsed()
                    );
                    ReconnectOutcome::Recovered
                }
                None => ReconnectOutcome::Ignored,
            };
        }

        if remote_cluster_id == snapshot.cluster_id {
            if snapshot.view.contains(uuid) {
                self.membership.mark_missing(address, uuid, Instant::now());
                self.deferred.insert(
                    *uuid,
                    DeferredReconnect {
                        address: address.clone(),
                        uuid: *uuid,
                        cluster_id: remote_cluster_id,
                        view: remote_view,
                    },
                );
                info!(
                    "Member {} ({}) reconnected but has already removed this member. Deciding once it is removed here.",
                    address, uuid
                );
                return ReconnectOutcome::Deferred;
            }
            warn!(
                "Split brain detected: member {} belongs to another sub-cluster of cluster {}.",
                address, remote_cluster_id
            );
        } else {
            warn!(
                "Split brain detected: member {} belongs to cluster {} (local cluster is {}).",
                address, remote_cluster_id, snapshot.cluster_id
            );
        }

        ReconnectOutcome::SplitBrain(SplitBrainDetected {
            local_cluster_id: snapshot.cluster_id,
            local_view: snapshot.view.clone(),
            remote_cluster_id,
            remote_view: Arc::new(remote_view),
            remote_address: address.clone(),
        })
    }

    /// Takes the deferred reconnects whose member has left the local member
    /// list, so they can be classified again. Deferred reconnects of a cluster
    /// this member no longer belongs to are dropped.
    pub fn take_ready(&self) -> Vec<DeferredReconnect> {
        let snapshot = self.membership.snapshot();
        self.deferred
            .retain(|_, deferred| deferred.cluster_id == snapshot.cluster_id);
        let ready: Vec<Uuid> = self
            .deferred
            .iter()
            .filter(|entry| !snapshot.view.contains(entry.key()))
            .map(|entry| *entry.key())
            .collect();
        ready
            .into_iter()
            .filter_map(|uuid| self.deferred.remove(&uuid).map(|(_, deferred)| deferred))
            .collect()
    }

    /// Removes members whose grace period has elapsed and publishes the new view.
    ///
    /// Only the member that will be master once the missing members are gone
    /// publishes the removal; every other member keeps its records until the
    /// master's member list update arrives. Returns the removed members.
    pub fn expire_missing(&self, now: Instant) -> Result<Vec<Member>, ClusterError> {
        loop {
            let current = self.membership.current();
            let missing = self.membership.missing_members();
            let expired: Vec<Uuid> = missing
                .iter()
                .filter(|record| now.saturating_duration_since(record.detected_at) >= self.grace_period)
                .filter(|record| current.contains(&record.uuid))
                .map(|record| record.uuid)
                .collect();

            // Records for members that already left the view are stale.
            for record in missing.iter().filter(|r| !current.contains(&r.uuid)) {
                self.membership.clear_missing(&record.uuid);
            }

            if expired.is_empty() {
                return Ok(Vec::new());
            }

            let next = current.without_members(&expired)?;
            let claims_mastership = next
                .master()
                .is_some_and(|m| m.uuid() == self.membership.local_uuid());
            if !claims_mastership {
                debug!(
                    "{} member(s) exceeded the grace period; waiting for the master to remove them.",
                    expired.len()
                );
                return Ok(Vec::new());
            }

            let removed: Vec<Member> = current
                .members()
                .filter(|m| expired.contains(&m.uuid()))
                .cloned()
                .collect();

            match self.membership.publish(next) {
                Ok(()) => {
                    for member in &removed {
                        info!("Removed member {} after the grace period elapsed.", member);
                    }
                    return Ok(removed);
                }
                Err(ClusterError::StaleVersion { expected, actual }) => {
                    debug!(
                        "Member removal raced with another publish (expected {}, got {}). Recomputing.",
                        expected, actual
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
