//! Dockyard - remote session and telemetry layer of a multi-host Docker console
//!
//! Pooled SSH connections to managed hosts, interactive terminals and
//! one-shot commands multiplexed over them, and host/container metrics
//! fanned out to WebSocket clients.

// Use mimalloc as the global allocator
// (many small short-lived allocations: frames, output chunks, snapshots)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod config;
pub mod console;
pub mod container;
pub mod error;
pub mod hosts;
pub mod monitor;
pub mod router;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::{GatewayServer, StaticTokenAuthenticator};
use config::{config_path, ConfigStorage};
use console::Console;
use hosts::StaticHostRegistry;
use ssh::RusshConnector;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Entry point of the `dockyard` binary: `dockyard [config-path]`
pub fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("dockyard {}", VERSION);
        return Ok(());
    }
    let explicit = args.get(1).map(PathBuf::from);

    init_logging();
    tracing::info!("Starting Dockyard {}...", VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;
    runtime.block_on(serve(explicit))
}

async fn serve(explicit: Option<PathBuf>) -> Result<(), String> {
    let path = config_path(explicit.as_deref()).map_err(|e| e.to_string())?;
    let config = ConfigStorage::with_path(path)
        .load()
        .await
        .map_err(|e| e.to_string())?;

    let authenticator = StaticTokenAuthenticator::new(&config.gateway.tokens);
    if authenticator.is_empty() {
        tracing::warn!("No gateway tokens configured, every client will be rejected");
    }
    let hosts = Arc::new(StaticHostRegistry::new(config.hosts.clone()));

    let console = Console::initialize(
        config,
        hosts,
        Arc::new(authenticator),
        None,
        Arc::new(RusshConnector),
    );

    let server = match GatewayServer::bind(console.gateway().clone()).await {
        Ok(server) => server,
        Err(e) => {
            console.shutdown().await;
            return Err(e);
        }
    };
    let server_task = tokio::spawn(server.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
        Err(e) => tracing::error!("Cannot listen for Ctrl-C: {}, shutting down", e),
    }

    console.shutdown().await;
    if let Err(e) = server_task.await {
        tracing::warn!("Gateway server task ended abnormally: {}", e);
    }
    tracing::info!("Dockyard stopped");
    Ok(())
}
