//! External HTTP surface: tunnel selection and request proxying
//!
//! `POST /select-tunnel` binds the caller to a tunnel via the sticky cookie;
//! every other request resolves that cookie, buffers the body, and runs the
//! envelope correlation protocol against the agent. Upgrade requests are
//! handed to the byte-level pass-through instead.

use crate::passthrough;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{request::Parts, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use backhaul_control::{session, RelayError};
use backhaul_proto::{HeaderValues, Headers, RequestEnvelope, ResponseEnvelope};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub id: Option<String>,
}

/// `POST /select-tunnel` - bind the caller to a tunnel id via cookie
pub async fn select_tunnel(
    State(state): State<AppState>,
    body: Option<Json<SelectRequest>>,
) -> Response {
    let Some(id) = body.and_then(|Json(req)| req.id).filter(|id| !id.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing id");
    };

    match session::select(&state.registry, &id) {
        Ok(cookie) => {
            let mut response = Json(json!({ "ok": true, "selected": id })).into_response();
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                    response
                }
                // A cookie we cannot render means the id itself is hostile
                Err(_) => error_json(StatusCode::BAD_REQUEST, "Invalid id"),
            }
        }
        Err(RelayError::UnknownTunnel(_)) => {
            error_json(StatusCode::NOT_FOUND, "Tunnel not connected")
        }
        Err(e) => {
            warn!(error = %e, "tunnel selection failed");
            relay_error_response(&e)
        }
    }
}

/// Catch-all: proxy the request through the caller's selected tunnel
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let Some(id) = session::resolve(req.headers()) else {
        return relay_error_response(&RelayError::MissingCookie);
    };

    let Some(tunnel) = state.registry.lookup(&id) else {
        debug!(tunnel_id = %id, "request for unconnected tunnel");
        return plain_error(StatusCode::BAD_GATEWAY, "No active tunnel");
    };
    if tunnel.is_closed() {
        return plain_error(StatusCode::BAD_GATEWAY, "No active tunnel");
    }

    if is_upgrade_request(req.headers()) {
        return passthrough::proxy_upgrade(tunnel, req).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "failed to buffer request body");
            return plain_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let envelope = build_envelope(&parts, body_bytes);
    match tunnel
        .request(envelope, state.config.request_timeout())
        .await
    {
        Ok(response) => render_response(response),
        Err(e) => {
            debug!(tunnel_id = %id, error = %e, "correlation failed");
            relay_error_response(&e)
        }
    }
}

/// True when the request asks for a protocol upgrade (WebSocket etc.)
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    if !headers.contains_key(header::UPGRADE) {
        return false;
    }
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Build the request envelope for one buffered HTTP call.
///
/// An empty body is encoded as absent; the agent side renders absent as an
/// empty body, so the round trip is lossless for complete buffers.
pub fn build_envelope(parts: &Parts, body: Bytes) -> RequestEnvelope {
    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else {
            debug!(header = %name, "skipping non-UTF-8 header value");
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| existing.push(value.to_string()))
            .or_insert_with(|| HeaderValues::One(value.to_string()));
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    RequestEnvelope {
        rid: uuid::Uuid::new_v4().to_string(),
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_vec())
        },
    }
}

/// Render the agent's response envelope as the final HTTP response.
///
/// Transport-framing headers (`transfer-encoding`, `content-length`) are
/// never copied verbatim; the HTTP layer recomputes framing for the buffered
/// body. Headers that do not parse are skipped, not fatal.
pub fn render_response(envelope: ResponseEnvelope) -> Response {
    let Ok(status) = StatusCode::from_u16(envelope.status_code()) else {
        warn!(status = envelope.status_code(), "agent sent invalid status code");
        return plain_error(StatusCode::BAD_GATEWAY, "Invalid response from tunnel");
    };

    let body = envelope.body.map(Bytes::from).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    for (name, values) in &envelope.headers {
        if is_transport_header(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "skipping invalid header name from agent");
            continue;
        };
        for value in values.iter() {
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    response.headers_mut().append(header_name.clone(), header_value);
                }
                Err(_) => warn!(header = %name, "skipping invalid header value from agent"),
            }
        }
    }

    response
}

fn is_transport_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding") || name.eq_ignore_ascii_case("content-length")
}

/// Map a relay error to the client-facing status code
pub fn relay_error_response(error: &RelayError) -> Response {
    let status = match error {
        RelayError::MissingId | RelayError::MissingCookie => StatusCode::BAD_REQUEST,
        RelayError::UnknownTunnel(_) => StatusCode::NOT_FOUND,
        RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RelayError::TunnelClosed
        | RelayError::InvalidTarget { .. }
        | RelayError::MalformedEnvelope(_) => StatusCode::BAD_GATEWAY,
    };
    plain_error(status, &error.to_string())
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
