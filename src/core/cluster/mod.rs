// src/core/cluster/mod.rs

//! This module contains all logic related to cluster membership, including
//! the versioned member list, split-brain detection, the merge orchestrator
//! and the management task that serializes them.

pub mod config;
pub mod detector;
pub mod direction;
pub mod member;
pub mod membership;
pub mod messages;
pub mod orchestrator;
pub mod service;
pub mod state;
pub mod status;
pub mod transport;
pub mod view;

// Re-export key types for easier access from other modules.
pub use config::ClusterConfig;
pub use detector::{
    DeferredReconnect, MergePair, MergeSide, ReconnectOutcome, SplitBrainDetected,
    SplitBrainDetector,
};
pub use direction::{MergeDirection, decide, decide_disjoint};
pub use member::{Address, Member};
pub use membership::{ClusterSnapshot, MembershipManager, MissingMemberRecord};
pub use messages::{Ack, ClusterMessage, ClusterReply, JoinRequest, MergeBatch};
pub use orchestrator::{MergeOrchestrator, MergePhase};
pub use service::{ClusterCommand, ClusterHandle, ClusterService};
pub use state::{ClusterState, ClusterStateHolder};
pub use status::{ClusterStatus, MemberStatus};
pub use transport::{InMemoryNetwork, MessageHandler, NetworkEndpoint, Transport};
pub use view::{ClusterIdentity, MembershipView, ViewMember};
