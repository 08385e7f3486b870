// src/core/cluster/status.rs

//! A read-only snapshot of one member's cluster core for administrative surfaces.

use super::member::{Address, Member};
use super::membership::{MembershipManager, MissingMemberRecord};
use super::orchestrator::MergePhase;
use super::state::ClusterState;
use super::view::ClusterIdentity;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub uuid: Uuid,
    pub address: Address,
    pub lite: bool,
    pub local: bool,
    pub join_version: u64,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub cluster_id: ClusterIdentity,
    pub local_member: Uuid,
    pub version: u64,
    pub master: Option<Address>,
    pub members: Vec<MemberStatus>,
    pub cluster_state: ClusterState,
    pub merge_phase: MergePhase,
    pub missing_members: Vec<MissingMemberRecord>,
    /// False while a merge is in progress or any member is missing.
    pub cluster_safe: bool,
}

impl ClusterStatus {
    pub fn collect(
        membership: &MembershipManager,
        cluster_state: ClusterState,
        merge_phase: MergePhase,
    ) -> Self {
        let snapshot = membership.snapshot();
        let view = &snapshot.view;
        let members = view
            .entries()
            .iter()
            .map(|entry| member_status(&entry.member, entry.join_version))
            .collect();
        let missing_members = membership.missing_members();
        let cluster_safe = merge_phase == MergePhase::Stable && missing_members.is_empty();

        Self {
            cluster_id: snapshot.cluster_id,
            local_member: membership.local_uuid(),
            version: view.version(),
            master: view.master().map(|m| m.address().clone()),
            members,
            cluster_state,
            merge_phase,
            missing_members,
            cluster_safe,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

fn member_status(member: &Member, join_version: u64) -> MemberStatus {
    MemberStatus {
        uuid: member.uuid(),
        address: member.address().clone(),
        lite: member.is_lite(),
        local: member.is_local(),
        join_version,
        attributes: member.attributes().clone(),
    }
}
