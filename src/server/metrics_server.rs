// src/server/metrics_server.rs

use crate::core::cluster::ClusterHandle;
use crate::core::metrics::gather_metrics;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Handles HTTP requests to the /cluster endpoint with a JSON status snapshot.
async fn cluster_handler(handle: ClusterHandle) -> impl IntoResponse {
    Json(handle.status())
}

/// Runs a simple HTTP server exposing Prometheus metrics on /metrics and the
/// cluster status on /cluster.
pub async fn run_metrics_server(
    handle: ClusterHandle,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/cluster", get(move || cluster_handler(handle.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return Err(e.into());
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await?;
    Ok(())
}
