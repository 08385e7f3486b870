// src/core/mod.rs

//! The central module containing the membership, split-brain detection and
//! merge logic of gridmerge.

pub mod cluster;
pub mod errors;
pub mod events;
pub mod merge;
pub mod metrics;
pub mod storage;

pub use errors::ClusterError;
