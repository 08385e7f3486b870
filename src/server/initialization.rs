// src/server/initialization.rs

//! Builds the cluster core of this member from its configuration.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::cluster::{ClusterService, ClusterStateHolder, InMemoryNetwork};
use crate::core::merge::{MergePolicyRegistry, StoreRegistry};
use crate::core::storage::RecordStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Initializes all member components before starting the main loop.
///
/// Merge policies are resolved here, so an unknown policy name stops startup.
pub fn setup(config: Config, policies: &MergePolicyRegistry) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let cluster_state = Arc::new(ClusterStateHolder::default());
    let stores = Arc::new(StoreRegistry::new());
    for ds in &config.data_structures {
        let store = Arc::new(RecordStore::new(ds.name.clone(), cluster_state.clone()));
        stores
            .register_configured(store, ds, policies)
            .with_context(|| format!("Invalid configuration for data structure '{}'", ds.name))?;
    }

    let network = InMemoryNetwork::new();
    let address = config.address();
    let (service, handle) = ClusterService::new(
        config.cluster.clone(),
        config.local_member(),
        stores,
        cluster_state,
        network.endpoint(address.clone()),
    );
    network.register(address, Arc::new(handle.clone()));
    info!("Cluster core initialized.");
    debug!(
        "Initial cluster status: {}",
        serde_json::to_string(&handle.status()).context("Failed to serialize cluster status")?
    );

    Ok(ServerContext {
        config,
        handle,
        network,
        service: Some(service),
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!(
        "Starting gridmerge member on {}:{}{}.",
        config.host,
        config.port,
        if config.lite_member { " (lite)" } else { "" }
    );
    info!(
        "Missing-member grace period: {:?}, merge timeout: {:?}.",
        config.cluster.missing_member_grace_period, config.cluster.merge_timeout
    );
    for ds in &config.data_structures {
        info!(
            "Data structure '{}': merge policy {}, batch size {}.",
            ds.name, ds.merge_policy.policy, ds.merge_policy.batch_size
        );
    }
}
