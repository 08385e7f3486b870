// src/core/cluster/orchestrator.rs

//! Drives a split-brain merge on the merging side.
//!
//! The orchestrator is owned by the cluster management task and advances its
//! state machine only there. The network part of a merge (handshake, entry
//! transfer, join) runs in a spawned task that reports back with a
//! `ClusterCommand::MergeFinished`, so the management task never blocks on it.

use super::detector::{MergePair, SplitBrainDetected};
use super::direction::{self, MergeDirection};
use super::member::{Address, Member};
use super::membership::MembershipManager;
use super::messages::{ClusterMessage, ClusterReply, JoinRequest, MergeBatch};
use super::service::{ClusterCommand, request_join};
use super::state::{ClusterState, ClusterStateHolder};
use super::transport::Transport;
use super::view::{ClusterIdentity, MembershipView};
use crate::core::ClusterError;
use crate::core::events::{EventBus, LifecycleEvent};
use crate::core::merge::{MergingEntryView, RegisteredStore, StoreRegistry};
use crate::core::metrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The merge state machine:
/// `STABLE -> MERGING -> MERGED -> STABLE` or `STABLE -> MERGING -> MERGE_FAILED -> STABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePhase {
    #[default]
    Stable,
    Merging,
    Merged,
    MergeFailed,
}

/// The result of a transfer task, posted back to the management task.
#[derive(Debug)]
pub struct MergeFinished {
    pub pair: MergePair,
    /// On success, the destination's identity and the view that admitted this member.
    pub result: Result<(ClusterIdentity, MembershipView), ClusterError>,
}

#[derive(Debug)]
struct InFlightMerge {
    pair: MergePair,
    remote_cluster_id: ClusterIdentity,
    previous_state: ClusterState,
    started_at: Instant,
}

pub struct MergeOrchestrator {
    membership: Arc<MembershipManager>,
    stores: Arc<StoreRegistry>,
    cluster_state: Arc<ClusterStateHolder>,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    phase: Arc<RwLock<MergePhase>>,
    merge_timeout: Duration,
    in_flight: Option<InFlightMerge>,
}

impl MergeOrchestrator {
    pub fn new(
        membership: Arc<MembershipManager>,
        stores: Arc<StoreRegistry>,
        cluster_state: Arc<ClusterStateHolder>,
        events: Arc<EventBus>,
        transport: Arc<dyn Transport>,
        phase: Arc<RwLock<MergePhase>>,
        merge_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            stores,
            cluster_state,
            events,
            transport,
            phase,
            merge_timeout,
            in_flight: None,
        }
    }

    pub fn phase(&self) -> MergePhase {
        *self.phase.read()
    }

    pub fn is_merging(&self) -> bool {
        self.in_flight.is_some()
    }

    fn set_phase(&self, next: MergePhase) {
        let mut phase = self.phase.write();
        debug!("Merge phase {} -> {}", *phase, next);
        *phase = next;
    }

    /// Reacts to a detected split brain. Starts a merge only when the local
    /// side is the one that merges; the surviving side waits for entries.
    pub fn on_split_brain(
        &mut self,
        detected: SplitBrainDetected,
        completion: mpsc::Sender<ClusterCommand>,
    ) {
        let pair = detected.pair();
        if let Some(in_flight) = &self.in_flight {
            if in_flight.pair == pair {
                debug!(
                    "Ignoring repeated split-brain signal for cluster {}: merge already in progress.",
                    detected.remote_cluster_id
                );
            } else {
                info!(
                    "Ignoring split brain with cluster {} while merging into cluster {}.",
                    detected.remote_cluster_id, in_flight.remote_cluster_id
                );
            }
            metrics::MERGES_TOTAL.with_label_values(&["ignored"]).inc();
            return;
        }

        match direction::decide_disjoint(&detected.local_view, &detected.remote_view) {
            Ok(MergeDirection::RemoteMergesIntoLocal) => {
                info!(
                    "Cluster {} ({} members) will merge into this cluster ({} members). Waiting for its entries.",
                    detected.remote_cluster_id,
                    detected.remote_view.size(),
                    detected.local_view.size()
                );
            }
            Ok(MergeDirection::LocalMergesIntoRemote) => self.start(detected, completion),
            Err(e) => {
                error!(
                    "Cannot merge with cluster {}: {}. Leaving both clusters untouched.",
                    detected.remote_cluster_id, e
                );
                self.emit_started(&detected);
                self.emit_failed(detected.local_cluster_id, &e);
                metrics::MERGES_TOTAL.with_label_values(&["failed"]).inc();
            }
        }
    }

    fn start(&mut self, detected: SplitBrainDetected, completion: mpsc::Sender<ClusterCommand>) {
        let pair = detected.pair();
        info!(
            "Merging this member of cluster {} into cluster {} via {}.",
            detected.local_cluster_id, detected.remote_cluster_id, detected.remote_address
        );

        let previous_state = self.cluster_state.set(ClusterState::Frozen);
        self.in_flight = Some(InFlightMerge {
            pair,
            remote_cluster_id: detected.remote_cluster_id,
            previous_state,
            started_at: Instant::now(),
        });
        self.set_phase(MergePhase::Merging);
        metrics::MERGE_IN_PROGRESS.set(1.0);
        self.emit_started(&detected);

        let transfer = Transfer {
            transport: self.transport.clone(),
            stores: self.stores.clone(),
            local_member: self.membership.local_member(),
            local_cluster_id: detected.local_cluster_id,
            local_version: self.membership.member_list_version(),
            local_view: detected.local_view.as_ref().clone(),
            remote_view: detected.remote_view.clone(),
            fallback: detected.remote_address.clone(),
        };
        let merge_timeout = self.merge_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(merge_timeout, transfer.run()).await {
                Ok(result) => result,
                Err(_) => Err(ClusterError::MergeAborted(format!(
                    "merge did not complete within {merge_timeout:?}"
                ))),
            };
            if completion
                .send(ClusterCommand::MergeFinished(MergeFinished { pair, result }))
                .await
                .is_err()
            {
                warn!("Merge finished after the cluster management task stopped.");
            }
        });
    }

    /// Completes or aborts the in-flight merge with the transfer task's result.
    pub fn on_transfer_finished(&mut self, finished: MergeFinished) {
        let Some(in_flight) = self.in_flight.take_if(|m| m.pair == finished.pair) else {
            warn!("Dropping the result of a merge that is no longer in flight.");
            return;
        };

        let previous_cluster_id = self.membership.cluster_id();
        let outcome = finished.result.and_then(|(cluster_id, view)| {
            if !view.contains(&self.membership.local_uuid()) {
                return Err(ClusterError::MergeAborted(
                    "destination view does not list this member".to_string(),
                ));
            }
            self.membership.adopt(cluster_id, view)?;
            Ok(cluster_id)
        });

        match outcome {
            Ok(cluster_id) => {
                // Only after adoption: a failed merge keeps its local data.
                self.stores.reset_all();
                self.cluster_state.set(in_flight.previous_state);
                self.set_phase(MergePhase::Merged);
                let elapsed = in_flight.started_at.elapsed();
                metrics::MERGE_DURATION_SECONDS.observe(elapsed.as_secs_f64());
                metrics::MERGES_TOTAL.with_label_values(&["merged"]).inc();
                info!(
                    "Merged into cluster {} in {:?}. Local data structures were handed over and reset.",
                    cluster_id, elapsed
                );
                self.events.publish_lifecycle(LifecycleEvent::Merged {
                    previous_cluster_id,
                    cluster_id,
                });
            }
            Err(e) => {
                if e.is_recoverable() {
                    warn!(
                        "Merge into cluster {} aborted: {}. Staying independent until the next reconnect.",
                        in_flight.remote_cluster_id, e
                    );
                } else {
                    error!(
                        "Merge into cluster {} failed: {}. Staying independent.",
                        in_flight.remote_cluster_id, e
                    );
                }
                self.cluster_state.set(in_flight.previous_state);
                self.set_phase(MergePhase::MergeFailed);
                metrics::MERGES_TOTAL.with_label_values(&["failed"]).inc();
                self.emit_failed(self.membership.cluster_id(), &e);
            }
        }

        metrics::MERGE_IN_PROGRESS.set(0.0);
        self.set_phase(MergePhase::Stable);
    }

    fn emit_started(&self, detected: &SplitBrainDetected) {
        self.events.publish_lifecycle(LifecycleEvent::MergingStarted {
            local_cluster_id: detected.local_cluster_id,
            remote_cluster_id: detected.remote_cluster_id,
        });
    }

    fn emit_failed(&self, cluster_id: ClusterIdentity, error: &ClusterError) {
        self.events.publish_lifecycle(LifecycleEvent::MergeFailed {
            cluster_id,
            reason: error.to_string(),
        });
    }
}

/// Everything the transfer task needs, detached from the management task.
struct Transfer {
    transport: Arc<dyn Transport>,
    stores: Arc<StoreRegistry>,
    local_member: Member,
    local_cluster_id: ClusterIdentity,
    local_version: u64,
    local_view: MembershipView,
    remote_view: Arc<MembershipView>,
    /// Used when the remote view names no master.
    fallback: Address,
}

impl Transfer {
    async fn run(self) -> Result<(ClusterIdentity, MembershipView), ClusterError> {
        let target = self
            .remote_view
            .master()
            .map(|m| m.address().clone())
            .unwrap_or_else(|| self.fallback.clone());

        self.handshake(&target).await?;
        let transferred = self.transfer_all(&target).await?;
        info!("Transferred {} entries to {}. Joining its cluster.", transferred, target);

        let request = JoinRequest {
            member: self.local_member.clone(),
            cluster_id: Some(self.local_cluster_id),
            member_list_version: self.local_version,
        };
        request_join(self.transport.as_ref(), target, request)
            .await
            .map_err(into_abort)
    }

    async fn handshake(&self, target: &Address) -> Result<(), ClusterError> {
        let message = ClusterMessage::MergeHandshake {
            cluster_id: self.local_cluster_id,
            view: self.local_view.clone(),
        };
        match self.transport.send(target, message).await.map_err(into_abort)? {
            ClusterReply::Accepted => {
                debug!("Merge handshake with {} accepted.", target);
                Ok(())
            }
            ClusterReply::Failed(e) => Err(e),
            other => Err(ClusterError::UnexpectedReply(format!(
                "{other:?} in reply to a merge handshake"
            ))),
        }
    }

    /// Sends every registered data structure concurrently; batches of one
    /// structure go out in order.
    async fn transfer_all(&self, target: &Address) -> Result<usize, ClusterError> {
        let mut tasks = JoinSet::new();
        for name in self.stores.names() {
            let Some(registered) = self.stores.get(&name) else {
                continue;
            };
            let transport = self.transport.clone();
            let target = target.clone();
            let source = self.local_cluster_id;
            tasks.spawn(async move { transfer_store(transport, target, source, registered).await });
        }

        let mut transferred = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(count)) => transferred += count,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(ClusterError::Internal(format!("transfer task failed: {e}")));
                }
            }
        }
        Ok(transferred)
    }
}

async fn transfer_store(
    transport: Arc<dyn Transport>,
    target: Address,
    source_cluster_id: ClusterIdentity,
    registered: RegisteredStore,
) -> Result<usize, ClusterError> {
    let name = registered.store.name().to_string();
    let entries: Vec<MergingEntryView> = registered.store.local_entries().collect();

    let mut acknowledged = 0;
    for chunk in entries.chunks(registered.batch_size) {
        let batch = MergeBatch {
            source_cluster_id,
            structure: name.clone(),
            entries: chunk.to_vec(),
        };
        match transport
            .send(&target, ClusterMessage::MergeEntries(batch))
            .await
            .map_err(into_abort)?
        {
            ClusterReply::Ack(ack) if ack.applied == chunk.len() => acknowledged += ack.applied,
            ClusterReply::Ack(ack) => {
                return Err(ClusterError::MergeAborted(format!(
                    "'{}' acknowledged {} of {} entries",
                    name,
                    ack.applied,
                    chunk.len()
                )));
            }
            ClusterReply::Failed(e) => return Err(e),
            other => {
                return Err(ClusterError::UnexpectedReply(format!(
                    "{other:?} in reply to a merge batch"
                )));
            }
        }
    }
    debug!(
        "Transferred {} of {} entries of '{}'.",
        acknowledged,
        entries.len(),
        name
    );
    Ok(acknowledged)
}

/// A destination that cannot be reached aborts the merge.
fn into_abort(error: ClusterError) -> ClusterError {
    match error {
        ClusterError::Transport(reason) => {
            ClusterError::MergeAborted(format!("destination unreachable: {reason}"))
        }
        other => other,
    }
}
