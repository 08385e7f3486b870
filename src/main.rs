// src/main.rs

//! The main entry point for a gridmerge member.

use anyhow::Result;
use gridmerge::config::Config;
use gridmerge::core::merge::MergePolicyRegistry;
use gridmerge::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("gridmerge version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via --config; it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override port if provided as a command-line argument
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => config.port = port,
            Some(Err(_)) => {
                eprintln!("Invalid port number: {}", args[port_index + 1]);
                std::process::exit(1);
            }
            None => {
                eprintln!("--port flag requires a value");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with reloading capabilities.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let policies = MergePolicyRegistry::new();
    if let Err(e) = server::run(config, config_path, &policies, Arc::new(reload_handle)).await {
        error!("Member runtime error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
