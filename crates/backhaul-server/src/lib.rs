//! HTTP and WebSocket ingress for the Backhaul relay
//!
//! Terminates the agents' persistent connections on `/connect`, the tunnel
//! selection endpoint on `/select-tunnel`, and proxies every other request
//! through the selected tunnel: buffered HTTP via the envelope correlation
//! protocol, upgrade requests via the byte-level pass-through.

pub mod agent;
pub mod config;
pub mod ingress;
pub mod passthrough;

use axum::routing::{any, post};
use axum::Router;
use backhaul_control::TunnelRegistry;
use config::ServerConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(registry: TunnelRegistry, config: ServerConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

/// Build the relay router: agent connect endpoint, tunnel selection, and a
/// catch-all that proxies through the caller's selected tunnel.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/connect", any(agent::connect))
        // Only POST selects; any other method on this path is tunnel
        // traffic like every other request
        .route(
            "/select-tunnel",
            post(ingress::select_tunnel).fallback(ingress::proxy),
        )
        .fallback(ingress::proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
