//! Cybernode agent binary.
//!
//! Loads configuration from the environment, starts the node and serves the
//! instantiation API until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cybernode::runtime::MockRuntime;
use cybernode::{api, Config, Cybernode};

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("CYBERNODE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cybernode");
    let config = Config::from_env()?;

    info!(
        node_id = %config.node_id,
        host_address = %config.host_address,
        listen_addr = %config.listen_addr,
        service_limit = config.service_limit,
        record_dir = ?config.record_dir,
        "Configuration loaded"
    );

    // No production runtime is wired in yet; services run in the mock.
    let runtime = Arc::new(MockRuntime::new());
    let node = Cybernode::new(config.clone(), runtime).await?;
    node.start().await?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Serving instantiation API");

    let server = axum::serve(listener, api::router(Arc::clone(&node)))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        });
    if let Err(e) = server.await {
        error!(error = %e, "API server error");
    }

    node.shutdown().await;
    info!("Cybernode shutdown complete");
    Ok(())
}
