//! Agent connect endpoint and per-connection tasks
//!
//! An agent upgrades `GET /connect?id=<id>` to a WebSocket; that socket is
//! the tunnel's transport for its whole lifetime. A writer task drains the
//! tunnel's outbound channel into the sink, and the receive loop feeds every
//! text frame through the tunnel's dispatch. Registration replaces any
//! previous connection with the same id.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use backhaul_control::{RelayError, Tunnel};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection before backpressure applies
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub id: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing agent id").into_response();
    };

    ws.on_upgrade(move |socket| handle_agent(state, id, socket))
        .into_response()
}

async fn handle_agent(state: AppState, id: String, socket: WebSocket) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let tunnel = Tunnel::new(id.clone(), outbound_tx);
    let connection_id = tunnel.connection_id().to_string();

    state.registry.register(tunnel.clone());

    let (mut sink, mut stream) = socket.split();

    // Writer task: tunnel outbound channel -> socket
    let writer_tunnel_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!(tunnel_id = %writer_tunnel_id, error = %e, "websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Receive loop: socket -> tunnel dispatch, until close or replacement
    let mut shutdown = tunnel.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => {
                debug!(tunnel_id = %id, "connection superseded, closing socket");
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match tunnel.handle_message(text.as_str()) {
                    Ok(()) => {}
                    Err(e @ RelayError::InvalidTarget { .. }) => {
                        warn!(tunnel_id = %id, error = %e, "closing agent connection");
                        break;
                    }
                    Err(e) => {
                        warn!(tunnel_id = %id, error = %e, "discarding undecodable agent frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(tunnel_id = %id, "agent closed connection");
                    break;
                }
                // Binary frames and ping/pong are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(tunnel_id = %id, error = %e, "websocket read error");
                    break;
                }
            }
        }
    }

    writer.abort();
    state.registry.remove(&id, &connection_id);
    info!(tunnel_id = %id, active_tunnels = state.registry.len(), "agent connection ended");
}
