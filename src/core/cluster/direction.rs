// src/core/cluster/direction.rs

//! Deterministic choice of which sub-cluster merges into which.
//!
//! The decision is a pure function of the two member lists, so every member
//! of both sides reaches the same answer without coordination:
//! the side with fewer members merges into the side with more members; on a
//! tie, the side whose smallest member address sorts lower merges into the other.

use super::view::MembershipView;
use crate::core::ClusterError;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDirection {
    /// The local side is the merging side and transfers its data.
    LocalMergesIntoRemote,
    /// The local side survives and only receives data.
    RemoteMergesIntoLocal,
}

impl MergeDirection {
    /// The same decision as seen from the other side.
    pub fn reversed(self) -> Self {
        match self {
            MergeDirection::LocalMergesIntoRemote => MergeDirection::RemoteMergesIntoLocal,
            MergeDirection::RemoteMergesIntoLocal => MergeDirection::LocalMergesIntoRemote,
        }
    }
}

/// Decides the merge direction from the local and remote views.
///
/// Fails with `AmbiguousMergeDirection` when the views are inconsistent
/// (empty, overlapping, or indistinguishable), instead of guessing.
pub fn decide(
    local: &MembershipView,
    remote: &MembershipView,
) -> Result<MergeDirection, ClusterError> {
    let (Some(local_min), Some(remote_min)) = (local.smallest_address(), remote.smallest_address())
    else {
        return Err(ClusterError::AmbiguousMergeDirection(
            "one of the member lists is empty".to_string(),
        ));
    };

    if let Some(shared) = local.members().find(|m| remote.contains(&m.uuid())) {
        return Err(ClusterError::AmbiguousMergeDirection(format!(
            "member {shared} appears in both member lists"
        )));
    }

    match local.size().cmp(&remote.size()) {
        Ordering::Less => return Ok(MergeDirection::LocalMergesIntoRemote),
        Ordering::Greater => return Ok(MergeDirection::RemoteMergesIntoLocal),
        Ordering::Equal => {}
    }

    match local_min.cmp(remote_min) {
        Ordering::Less => Ok(MergeDirection::LocalMergesIntoRemote),
        Ordering::Greater => Ok(MergeDirection::RemoteMergesIntoLocal),
        Ordering::Equal => Err(ClusterError::AmbiguousMergeDirection(format!(
            "both member lists have {} members and share the smallest address {}",
            local.size(),
            local_min
        ))),
    }
}

/// Decides the direction while some members are moving between the clusters.
///
/// Members that appear in both lists have already joined the destination
/// while their old cluster still lists them. They are ignored on both sides,
/// so the result stays the same whichever side is treated as local.
pub fn decide_disjoint(
    local: &MembershipView,
    remote: &MembershipView,
) -> Result<MergeDirection, ClusterError> {
    let without_shared = |view: &MembershipView, other: &MembershipView| -> Result<MembershipView, ClusterError> {
        MembershipView::from_parts(
            view.version(),
            view.entries()
                .iter()
                .filter(|entry| !other.contains(&entry.member.uuid()))
                .cloned()
                .collect(),
        )
    };
    let local_only = without_shared(local, remote)?;
    let remote_only = without_shared(remote, local)?;
    decide(&local_only, &remote_only)
}
