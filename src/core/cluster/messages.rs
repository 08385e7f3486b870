// src/core/cluster/messages.rs

//! The request and reply types exchanged between members.

use super::member::{Address, Member};
use super::view::{ClusterIdentity, MembershipView};
use crate::core::ClusterError;
use crate::core::merge::MergingEntryView;
use bincode::config;
use serde::{Deserialize, Serialize};

/// Asks a master to admit `member` into its cluster.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinRequest {
    pub member: Member,
    /// The cluster the joiner belonged to before, if any.
    pub cluster_id: Option<ClusterIdentity>,
    /// The joiner's current member list version. The admitting view is
    /// published above it.
    pub member_list_version: u64,
}

/// One ordered chunk of a data structure's entries sent during a merge.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MergeBatch {
    pub source_cluster_id: ClusterIdentity,
    pub structure: String,
    pub entries: Vec<MergingEntryView>,
}

/// Acknowledges a `MergeBatch`. `applied` entries are committed on the receiver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub structure: String,
    pub applied: usize,
}

/// Messages sent from one member to another.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClusterMessage {
    Join(JoinRequest),
    /// Pushed by the master to every member after it publishes a new view.
    MemberListUpdate {
        cluster_id: ClusterIdentity,
        view: MembershipView,
    },
    /// Opens a merge. The receiver cross-checks the direction before accepting entries.
    MergeHandshake {
        cluster_id: ClusterIdentity,
        view: MembershipView,
    },
    MergeEntries(MergeBatch),
}

impl ClusterMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Join(_) => "Join",
            ClusterMessage::MemberListUpdate { .. } => "MemberListUpdate",
            ClusterMessage::MergeHandshake { .. } => "MergeHandshake",
            ClusterMessage::MergeEntries(_) => "MergeEntries",
        }
    }
}

/// Replies to a `ClusterMessage`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClusterReply {
    Joined {
        cluster_id: ClusterIdentity,
        view: MembershipView,
    },
    /// The receiver is not the master; retry against `master`.
    NotMaster { master: Option<Address> },
    Accepted,
    Ack(Ack),
    Failed(ClusterError),
}

/// Encodes a message or reply for the wire.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClusterError> {
    Ok(bincode::serde::encode_to_vec(value, config::standard())?)
}

/// Decodes a message or reply from the wire, rejecting trailing bytes.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ClusterError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, config::standard())?;
    if read != bytes.len() {
        return Err(ClusterError::Serialization(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(value)
}
