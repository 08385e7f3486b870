// src/server/mod.rs

use crate::config::Config;
use crate::core::merge::MergePolicyRegistry;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use context::ServerContext;

/// The handle used to change the log filter at runtime.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// The member startup function, orchestrating all setup phases.
///
/// Runs until SIGINT or SIGTERM. SIGHUP re-reads `log_level` from `config_path`.
pub async fn run(
    config: Config,
    config_path: &str,
    policies: &MergePolicyRegistry,
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    // 1. Build the cluster core.
    let mut ctx = initialization::setup(config, policies)?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut ctx)?;

    // 3. Wait for a shutdown signal.
    main_loop(&mut ctx, config_path, &log_reload_handle).await?;

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }
    ctx.network.deregister(&ctx.config.address());

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }
    info!("Member shutdown complete.");
    Ok(())
}

async fn main_loop(
    ctx: &mut ServerContext,
    config_path: &str,
    log_reload_handle: &LogReloadHandle,
) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow!("Failed to register SIGHUP handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                return Ok(());
            }
            _ = sighup.recv() => {
                reload_log_level(config_path, log_reload_handle);
            }
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => {
                        error!("CRITICAL: Background task failed: {}. Shutting down.", e);
                        return Err(e);
                    }
                    Err(e) => {
                        error!("CRITICAL: Background task panicked: {e:?}. Shutting down.");
                        return Err(anyhow!("background task panicked"));
                    }
                }
            }
        }
    }
}

fn reload_log_level(config_path: &str, log_reload_handle: &LogReloadHandle) {
    let level = match Config::from_file(config_path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("SIGHUP: keeping the current log level: {:#}", e);
            return;
        }
    };
    match EnvFilter::try_new(&level) {
        Ok(filter) => match log_reload_handle.reload(filter) {
            Ok(()) => info!("SIGHUP: log level set to '{}'.", level),
            Err(e) => warn!("SIGHUP: failed to apply log level '{}': {}", level, e),
        },
        Err(e) => warn!("SIGHUP: invalid log level '{}': {}", level, e),
    }
}
