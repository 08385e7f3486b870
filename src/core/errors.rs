// src/core/errors.rs

//! Defines the primary error type for the membership, detection and merge layers.

use crate::core::cluster::state::ClusterState;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// The main error enum, representing all possible failures within the cluster core.
///
/// Every variant carries only owned, cloneable data so that errors can be sent
/// back to a remote member inside a `ClusterReply` and compared in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterError {
    /// An optimistic publish lost a race. The caller recomputes from the latest view.
    #[error("Stale member list version: expected {expected}, got {actual}")]
    StaleVersion { expected: u64, actual: u64 },

    /// The destination became unreachable or timed out while a merge was in flight.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Both sides computed different survivors. Fatal to the current attempt only.
    #[error("Ambiguous merge direction: {0}")]
    AmbiguousMergeDirection(String),

    #[error("Member {0} is already part of the member list")]
    DuplicateMember(String),

    #[error("Member {0} not found")]
    MemberNotFound(String),

    #[error("Invalid member address '{0}'")]
    InvalidAddress(String),

    #[error("Operation not allowed while the cluster state is {0}")]
    ClusterStateForbidsMutation(ClusterState),

    /// Returned by a member that received a master-only request.
    #[error("This member is not the master (master: {0})")]
    NotMaster(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown merge policy '{0}'")]
    UnknownMergePolicy(String),

    #[error("Unknown data structure '{0}'")]
    UnknownDataStructure(String),

    #[error("Data structure '{0}' is already registered")]
    DuplicateDataStructure(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Cluster management channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Returns `true` for failures that leave the cluster fully operational and
    /// are resolved by retrying on the next trigger.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClusterError::StaleVersion { .. }
                | ClusterError::MergeAborted(_)
                | ClusterError::Transport(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for ClusterError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for ClusterError {
    fn from(_: oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}
