// src/server/context.rs

use crate::config::Config;
use crate::core::cluster::{ClusterHandle, ClusterService, InMemoryNetwork};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the member's main loop.
pub struct ServerContext {
    pub config: Config,
    pub handle: ClusterHandle,
    pub network: Arc<InMemoryNetwork>,
    /// Taken by the spawner when the management task starts.
    pub service: Option<ClusterService>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
