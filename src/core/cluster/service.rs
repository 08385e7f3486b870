// src/core/cluster/service.rs

//! The cluster management context.
//!
//! One tokio task owns every view publication and every merge state
//! transition. Transport signals, peer requests and completed background work
//! reach it as `ClusterCommand`s over an mpsc channel; `ClusterHandle` is the
//! cloneable front door used by the transport and by the application.

use super::config::ClusterConfig;
use super::detector::{ReconnectOutcome, SplitBrainDetector};
use super::direction::{self, MergeDirection};
use super::member::{Address, Member};
use super::membership::MembershipManager;
use super::messages::{Ack, ClusterMessage, ClusterReply, JoinRequest, MergeBatch};
use super::orchestrator::{MergeFinished, MergeOrchestrator, MergePhase};
use super::state::{ClusterState, ClusterStateHolder};
use super::status::ClusterStatus;
use super::transport::{MessageHandler, Transport};
use super::view::{ClusterIdentity, MembershipView};
use crate::core::ClusterError;
use crate::core::events::{EventBus, LifecycleEvent, MembershipEvent};
use crate::core::merge::StoreRegistry;
use async_trait::async_trait;
use futures::future;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on commands drained from the channel in one pass.
const MAX_COMMAND_BATCH: usize = 64;

/// Upper bound on `NotMaster` redirects followed by one join attempt.
const MAX_JOIN_REDIRECTS: usize = 3;

/// Work for the cluster management task.
#[derive(Debug)]
pub enum ClusterCommand {
    MemberUnreachable {
        address: Address,
        uuid: Uuid,
    },
    MemberReconnected {
        address: Address,
        uuid: Uuid,
        cluster_id: ClusterIdentity,
        view: MembershipView,
    },
    /// A peer asks to be admitted. Consecutive joins share one member list broadcast.
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<ClusterReply>,
    },
    MemberListUpdate {
        cluster_id: ClusterIdentity,
        view: MembershipView,
        reply: oneshot::Sender<ClusterReply>,
    },
    MergeHandshake {
        cluster_id: ClusterIdentity,
        view: MembershipView,
        reply: oneshot::Sender<ClusterReply>,
    },
    /// Join the cluster reachable through `seed`, leaving the current one.
    JoinCluster {
        seed: Address,
        reply: oneshot::Sender<Result<ClusterIdentity, ClusterError>>,
    },
    /// Result of a background join started by `JoinCluster`.
    Adopt {
        cluster_id: ClusterIdentity,
        view: MembershipView,
        reply: oneshot::Sender<Result<ClusterIdentity, ClusterError>>,
    },
    MergeFinished(MergeFinished),
}

/// Sends `request` to `seed`, following `NotMaster` redirects, and returns the
/// identity and view of the cluster that admitted the member.
pub(crate) async fn request_join(
    transport: &dyn Transport,
    seed: Address,
    request: JoinRequest,
) -> Result<(ClusterIdentity, MembershipView), ClusterError> {
    let mut target = seed;
    for _ in 0..=MAX_JOIN_REDIRECTS {
        match transport
            .send(&target, ClusterMessage::Join(request.clone()))
            .await?
        {
            ClusterReply::Joined { cluster_id, view } => return Ok((cluster_id, view)),
            ClusterReply::NotMaster {
                master: Some(master),
            } if master != target => {
                debug!("{} is not the master; retrying the join at {}.", target, master);
                target = master;
            }
            ClusterReply::NotMaster { master } => {
                return Err(ClusterError::NotMaster(format!("{master:?}")));
            }
            ClusterReply::Failed(e) => return Err(e),
            other => {
                return Err(ClusterError::UnexpectedReply(format!(
                    "{other:?} in reply to a join request"
                )));
            }
        }
    }
    Err(ClusterError::NotMaster(format!(
        "no master found after {MAX_JOIN_REDIRECTS} redirects"
    )))
}

/// The state owned by the management task.
pub struct ClusterService {
    config: ClusterConfig,
    membership: Arc<MembershipManager>,
    detector: SplitBrainDetector,
    orchestrator: MergeOrchestrator,
    stores: Arc<StoreRegistry>,
    transport: Arc<dyn Transport>,
    command_tx: mpsc::Sender<ClusterCommand>,
    command_rx: mpsc::Receiver<ClusterCommand>,
}

/// A cloneable handle to a member's cluster core.
#[derive(Clone)]
pub struct ClusterHandle {
    command_tx: mpsc::Sender<ClusterCommand>,
    membership: Arc<MembershipManager>,
    stores: Arc<StoreRegistry>,
    cluster_state: Arc<ClusterStateHolder>,
    events: Arc<EventBus>,
    phase: Arc<RwLock<MergePhase>>,
}

impl ClusterService {
    /// Builds the core of one member that starts as a single-member cluster.
    pub fn new(
        config: ClusterConfig,
        local: Member,
        stores: Arc<StoreRegistry>,
        cluster_state: Arc<ClusterStateHolder>,
        transport: Arc<dyn Transport>,
    ) -> (ClusterService, ClusterHandle) {
        Self::with_identity(
            config,
            local,
            ClusterIdentity::generate(),
            stores,
            cluster_state,
            transport,
        )
    }

    /// Like `new`, with a given cluster identity.
    pub fn with_identity(
        config: ClusterConfig,
        local: Member,
        cluster_id: ClusterIdentity,
        stores: Arc<StoreRegistry>,
        cluster_state: Arc<ClusterStateHolder>,
        transport: Arc<dyn Transport>,
    ) -> (ClusterService, ClusterHandle) {
        let events = Arc::new(EventBus::new());
        let membership = Arc::new(MembershipManager::new(
            local.with_local(true),
            cluster_id,
            events.clone(),
        ));
        let phase = Arc::new(RwLock::new(MergePhase::Stable));
        let (command_tx, command_rx) = mpsc::channel(config.management_channel_capacity);

        let detector =
            SplitBrainDetector::new(membership.clone(), config.missing_member_grace_period);
        let orchestrator = MergeOrchestrator::new(
            membership.clone(),
            stores.clone(),
            cluster_state.clone(),
            events.clone(),
            transport.clone(),
            phase.clone(),
            config.merge_timeout,
        );

        let handle = ClusterHandle {
            command_tx: command_tx.clone(),
            membership: membership.clone(),
            stores: stores.clone(),
            cluster_state,
            events,
            phase,
        };
        let service = ClusterService {
            config,
            membership,
            detector,
            orchestrator,
            stores,
            transport,
            command_tx,
            command_rx,
        };
        (service, handle)
    }

    /// The main loop of the management task.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut grace_tick = time::interval(self.config.missing_member_check_interval);
        grace_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Cluster management task started for {} in cluster {}.",
            self.membership.local_member(),
            self.membership.cluster_id()
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Cluster management task shutting down.");
                    return;
                }
                _ = grace_tick.tick() => {
                    self.expire_missing_members();
                }
                Some(command) = self.command_rx.recv() => {
                    let mut batch = vec![command];
                    while batch.len() < MAX_COMMAND_BATCH {
                        match self.command_rx.try_recv() {
                            Ok(next) => batch.push(next),
                            Err(_) => break,
                        }
                    }
                    self.process(batch);
                }
            }
        }
    }

    fn process(&mut self, batch: Vec<ClusterCommand>) {
        let mut joins = Vec::new();
        for command in batch {
            match command {
                ClusterCommand::Join { request, reply } => joins.push((request, reply)),
                other => {
                    if !joins.is_empty() {
                        self.admit(std::mem::take(&mut joins));
                    }
                    self.handle_command(other);
                }
            }
        }
        if !joins.is_empty() {
            self.admit(joins);
        }
    }

    fn handle_command(&mut self, command: ClusterCommand) {
        match command {
            ClusterCommand::MemberUnreachable { address, uuid } => {
                self.detector
                    .on_member_unreachable(&address, &uuid, Instant::now());
            }
            ClusterCommand::MemberReconnected {
                address,
                uuid,
                cluster_id,
                view,
            } => self.on_reconnected(address, uuid, cluster_id, view),
            ClusterCommand::Join { request, reply } => self.admit(vec![(request, reply)]),
            ClusterCommand::MemberListUpdate {
                cluster_id,
                view,
                reply,
            } => {
                let version = view.version();
                let answer = if self.orchestrator.is_merging() {
                    // The member list stays put until the merge adopts the destination's.
                    ClusterReply::Failed(ClusterError::ClusterStateForbidsMutation(
                        ClusterState::Frozen,
                    ))
                } else if self.membership.install(cluster_id, view) {
                    self.recheck_deferred();
                    ClusterReply::Accepted
                } else {
                    ClusterReply::Failed(ClusterError::StaleVersion {
                        expected: self.membership.member_list_version() + 1,
                        actual: version,
                    })
                };
                let _ = reply.send(answer);
            }
            ClusterCommand::MergeHandshake {
                cluster_id,
                view,
                reply,
            } => {
                let _ = reply.send(self.on_merge_handshake(cluster_id, &view));
            }
            ClusterCommand::JoinCluster { seed, reply } => self.start_join(seed, reply),
            ClusterCommand::Adopt {
                cluster_id,
                view,
                reply,
            } => {
                let result = if self.orchestrator.is_merging() {
                    Err(ClusterError::ClusterStateForbidsMutation(ClusterState::Frozen))
                } else {
                    self.membership.adopt(cluster_id, view).map(|()| cluster_id)
                };
                let _ = reply.send(result);
            }
            ClusterCommand::MergeFinished(finished) => {
                self.orchestrator.on_transfer_finished(finished);
            }
        }
    }

    fn on_reconnected(
        &mut self,
        address: Address,
        uuid: Uuid,
        cluster_id: ClusterIdentity,
        view: MembershipView,
    ) {
        if let ReconnectOutcome::SplitBrain(detected) =
            self.detector
                .on_member_reconnected(&address, &uuid, cluster_id, view)
        {
            self.orchestrator
                .on_split_brain(detected, self.command_tx.clone());
        }
    }

    /// Classifies again the reconnects that waited for their member to leave
    /// the local member list.
    fn recheck_deferred(&mut self) {
        for deferred in self.detector.take_ready() {
            debug!(
                "Re-evaluating the reconnect of {} now that it left the member list.",
                deferred.address
            );
            self.on_reconnected(
                deferred.address,
                deferred.uuid,
                deferred.cluster_id,
                deferred.view,
            );
        }
    }

    /// Admits joiners one at a time, each under its own member list version.
    ///
    /// The admitting view is published above the joiner's own version, so the
    /// joiner never sees its version move backwards when it adopts the view.
    fn admit(&mut self, requests: Vec<(JoinRequest, oneshot::Sender<ClusterReply>)>) {
        if !self.membership.is_master() {
            let master = self.membership.master().map(|m| m.address().clone());
            for (_, reply) in requests {
                let _ = reply.send(ClusterReply::NotMaster {
                    master: master.clone(),
                });
            }
            return;
        }
        if self.orchestrator.is_merging() {
            for (request, reply) in requests {
                debug!("Refusing join of {} while merging.", request.member);
                let _ = reply.send(ClusterReply::Failed(
                    ClusterError::ClusterStateForbidsMutation(ClusterState::Frozen),
                ));
            }
            return;
        }

        let mut admitted: HashSet<Uuid> = HashSet::new();
        let mut accepted = Vec::new();
        for (request, reply) in requests {
            let current = self.membership.current();
            let member = request.member.with_local(false);
            let by_uuid = current.member(&member.uuid());
            let by_address = current.member_by_address(member.address());
            match (by_uuid, by_address) {
                (Some(a), Some(b)) if a.uuid() == b.uuid() => {
                    debug!("{} is already a member; answering the join idempotently.", a);
                    accepted.push(reply);
                }
                (None, None) => {
                    let version = (current.version() + 1).max(request.member_list_version + 1);
                    let published = current
                        .with_member_admitted(member.clone(), version)
                        .and_then(|next| self.membership.publish_at(next));
                    match published {
                        Ok(()) => {
                            info!(
                                "Admitted {} into cluster {} at member list version {}.",
                                member,
                                self.membership.cluster_id(),
                                version
                            );
                            admitted.insert(member.uuid());
                            accepted.push(reply);
                        }
                        Err(e) => {
                            error!("Failed to admit {}: {}", member, e);
                            let _ = reply.send(ClusterReply::Failed(e));
                        }
                    }
                }
                _ => {
                    warn!(
                        "Rejecting join of {}: its UUID or address belongs to another member.",
                        member
                    );
                    let _ = reply.send(ClusterReply::Failed(ClusterError::DuplicateMember(
                        member.to_string(),
                    )));
                }
            }
        }

        let snapshot = self.membership.snapshot();
        for reply in accepted {
            let _ = reply.send(ClusterReply::Joined {
                cluster_id: snapshot.cluster_id,
                view: snapshot.view.as_ref().clone(),
            });
        }

        if !admitted.is_empty() {
            self.broadcast_view(&admitted);
        }
    }

    /// Pushes the current view to every other member except `skip`. Best effort.
    fn broadcast_view(&self, skip: &HashSet<Uuid>) {
        let snapshot = self.membership.snapshot();
        let local = self.membership.local_uuid();
        let targets: Vec<Address> = snapshot
            .view
            .members()
            .filter(|m| m.uuid() != local && !skip.contains(&m.uuid()))
            .map(|m| m.address().clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        let transport = self.transport.clone();
        let cluster_id = snapshot.cluster_id;
        let view = snapshot.view.as_ref().clone();
        tokio::spawn(async move {
            let pushes = targets.into_iter().map(|target| {
                let transport = transport.clone();
                let message = ClusterMessage::MemberListUpdate {
                    cluster_id,
                    view: view.clone(),
                };
                async move {
                    match transport.send(&target, message).await {
                        Ok(ClusterReply::Accepted) => {}
                        Ok(reply) => {
                            debug!("{} did not install member list update: {:?}", target, reply)
                        }
                        Err(e) => debug!("Failed to push member list to {}: {}", target, e),
                    }
                }
            });
            future::join_all(pushes).await;
        });
    }

    /// Cross-checks the merge direction before any entry is accepted.
    fn on_merge_handshake(
        &self,
        remote_cluster_id: ClusterIdentity,
        remote_view: &MembershipView,
    ) -> ClusterReply {
        let snapshot = self.membership.snapshot();
        if remote_view.contains(&self.membership.local_uuid()) {
            return ClusterReply::Failed(ClusterError::AmbiguousMergeDirection(format!(
                "merge handshake from cluster {remote_cluster_id}, whose member list contains this member"
            )));
        }
        if self.orchestrator.is_merging() {
            return ClusterReply::Failed(ClusterError::MergeAborted(
                "this member is merging into another cluster".to_string(),
            ));
        }
        if remote_cluster_id == snapshot.cluster_id
            && remote_view.members().any(|m| snapshot.view.contains(&m.uuid()))
        {
            return ClusterReply::Failed(ClusterError::MergeAborted(format!(
                "sub-cluster of {remote_cluster_id} still has members in this member list"
            )));
        }

        match direction::decide_disjoint(&snapshot.view, remote_view) {
            Ok(MergeDirection::RemoteMergesIntoLocal) => {
                info!(
                    "Accepting merge of cluster {} into cluster {}.",
                    remote_cluster_id, snapshot.cluster_id
                );
                ClusterReply::Accepted
            }
            Ok(MergeDirection::LocalMergesIntoRemote) => {
                let e = ClusterError::AmbiguousMergeDirection(format!(
                    "cluster {} ({} members) asked to merge into cluster {} ({} members), but this side should merge",
                    remote_cluster_id,
                    remote_view.size(),
                    snapshot.cluster_id,
                    snapshot.view.size()
                ));
                error!("Rejecting merge handshake: {}", e);
                ClusterReply::Failed(e)
            }
            Err(e) => {
                error!("Rejecting merge handshake from cluster {}: {}", remote_cluster_id, e);
                ClusterReply::Failed(e)
            }
        }
    }

    fn expire_missing_members(&mut self) {
        if self.orchestrator.is_merging() {
            return;
        }
        match self.detector.expire_missing(Instant::now()) {
            Ok(removed) if !removed.is_empty() => {
                self.broadcast_view(&HashSet::new());
                self.recheck_deferred();
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to remove missing members: {}", e),
        }
    }

    fn start_join(
        &mut self,
        seed: Address,
        reply: oneshot::Sender<Result<ClusterIdentity, ClusterError>>,
    ) {
        if self.orchestrator.is_merging() {
            let _ = reply.send(Err(ClusterError::ClusterStateForbidsMutation(
                ClusterState::Frozen,
            )));
            return;
        }
        let transport = self.transport.clone();
        let command_tx = self.command_tx.clone();
        let request = JoinRequest {
            member: self.membership.local_member(),
            cluster_id: Some(self.membership.cluster_id()),
            member_list_version: self.membership.member_list_version(),
        };
        info!("Joining the cluster at {}.", seed);
        tokio::spawn(async move {
            match request_join(transport.as_ref(), seed, request).await {
                Ok((cluster_id, view)) => {
                    let command = ClusterCommand::Adopt {
                        cluster_id,
                        view,
                        reply,
                    };
                    if let Err(e) = command_tx.send(command).await {
                        warn!("Join completed after the management task stopped: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Join failed: {}", e);
                    let _ = reply.send(Err(e));
                }
            }
        });
    }
}

impl ClusterHandle {
    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<ClusterReply>) -> ClusterCommand,
    ) -> ClusterReply {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(build(tx)).await.is_err() {
            return ClusterReply::Failed(ClusterError::ChannelClosed);
        }
        rx.await
            .unwrap_or(ClusterReply::Failed(ClusterError::ChannelClosed))
    }

    /// Transport signal: `address`/`uuid` can no longer be reached.
    pub async fn on_member_unreachable(
        &self,
        address: Address,
        uuid: Uuid,
    ) -> Result<(), ClusterError> {
        self.command_tx
            .send(ClusterCommand::MemberUnreachable { address, uuid })
            .await?;
        Ok(())
    }

    /// Transport signal: `address`/`uuid` is reachable again and reports
    /// `cluster_id` with `view`.
    pub async fn on_member_reconnected(
        &self,
        address: Address,
        uuid: Uuid,
        cluster_id: ClusterIdentity,
        view: MembershipView,
    ) -> Result<(), ClusterError> {
        self.command_tx
            .send(ClusterCommand::MemberReconnected {
                address,
                uuid,
                cluster_id,
                view,
            })
            .await?;
        Ok(())
    }

    /// Joins the cluster reachable through `seed`.
    pub async fn join(&self, seed: Address) -> Result<ClusterIdentity, ClusterError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ClusterCommand::JoinCluster { seed, reply })
            .await?;
        rx.await?
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }

    pub fn cluster_state(&self) -> &Arc<ClusterStateHolder> {
        &self.cluster_state
    }

    pub fn merge_phase(&self) -> MergePhase {
        *self.phase.read()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe_membership()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe_lifecycle()
    }

    /// A read-only snapshot for administrative surfaces.
    pub fn status(&self) -> ClusterStatus {
        ClusterStatus::collect(
            &self.membership,
            self.cluster_state.get(),
            self.merge_phase(),
        )
    }
}

#[async_trait]
impl MessageHandler for ClusterHandle {
    async fn handle(&self, from: &Address, message: ClusterMessage) -> ClusterReply {
        match message {
            ClusterMessage::Join(request) => {
                self.call(|reply| ClusterCommand::Join { request, reply })
                    .await
            }
            ClusterMessage::MemberListUpdate { cluster_id, view } => {
                self.call(|reply| ClusterCommand::MemberListUpdate {
                    cluster_id,
                    view,
                    reply,
                })
                .await
            }
            ClusterMessage::MergeHandshake { cluster_id, view } => {
                self.call(|reply| ClusterCommand::MergeHandshake {
                    cluster_id,
                    view,
                    reply,
                })
                .await
            }
            ClusterMessage::MergeEntries(batch) => self.apply_merge_batch(from, batch),
        }
    }
}

impl ClusterHandle {
    /// Applies an incoming merge batch on the surviving side. Refused unless
    /// this member is `Stable`.
    fn apply_merge_batch(&self, from: &Address, batch: MergeBatch) -> ClusterReply {
        let snapshot = self.membership.snapshot();
        if batch.source_cluster_id == snapshot.cluster_id
            && snapshot.view.member_by_address(from).is_some()
        {
            return ClusterReply::Failed(ClusterError::AmbiguousMergeDirection(format!(
                "merge entries from {from}, a member of this cluster"
            )));
        }

        // Held until the batch is applied, so a merge of this member cannot start in between.
        let phase = self.phase.read();
        if *phase != MergePhase::Stable {
            return ClusterReply::Failed(ClusterError::MergeAborted(format!(
                "the destination is in merge phase {}",
                *phase
            )));
        }
        match self.stores.apply_batch(&batch.structure, &batch.entries) {
            Ok(applied) => {
                debug!(
                    "Applied {} merge entries for '{}' from {}.",
                    applied, batch.structure, from
                );
                ClusterReply::Ack(Ack {
                    structure: batch.structure,
                    applied,
                })
            }
            Err(e) => ClusterReply::Failed(e),
        }
    }
}
