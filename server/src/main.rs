use std::sync::Arc;

use anyhow::Context;
use switchyard_hub::storage::MemoryStorage;
use switchyard_hub::{listener, Hub, HubConfig};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = HubConfig::load().context("loading hub config")?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_timeout_ms = config.heartbeat_timeout_ms,
        max_concurrent_per_agent = config.max_concurrent_per_agent,
        "starting switchyard hub"
    );

    let socket = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let hub = Hub::new(config, Arc::new(MemoryStorage::new()));
    hub.start();

    let shutdown = hub.shutdown_token();
    let server = tokio::spawn(listener::serve(hub.clone(), socket, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    hub.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "listener failed"),
        Err(e) => error!(error = %e, "listener task panicked"),
    }
    Ok(())
}
