// src/server/spawner.rs

//! Spawns all of the member's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use anyhow::{Result, anyhow};
use tracing::info;

/// Spawns all critical background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Cluster Management Task ---
    let service = ctx
        .service
        .take()
        .ok_or_else(|| anyhow!("cluster management task was already started"))?;
    let shutdown_rx_cluster = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        service.run(shutdown_rx_cluster).await;
        Ok(())
    });

    // --- Metrics Server ---
    if ctx.config.metrics.enabled {
        let handle = ctx.handle.clone();
        let port = ctx.config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(handle, port, shutdown_rx_metrics).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
