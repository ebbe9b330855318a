//! Backhaul relay server entry point

use anyhow::{Context, Result};
use backhaul_control::TunnelRegistry;
use backhaul_server::config::ServerConfig;
use backhaul_server::{router, AppState};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = config.listen_addr();
    let registry = TunnelRegistry::new();
    let state = AppState::new(registry, config);

    let listener = TcpListener::bind(addr).await.with_context(|| {
        format!("failed to bind {addr} - is another process using this port?")
    })?;

    info!(%addr, "relay listening");
    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    Ok(())
}
