//! Byte-level WebSocket pass-through
//!
//! Upgrade requests that are not the agent's own `/connect` bypass the
//! envelope protocol entirely: if the caller's tunnel has a validated
//! plain-proxy target, the original request head is replayed to the target
//! over TCP, the target's 101 is relayed back, and the two connections are
//! bridged byte for byte. No target means the upgrade is rejected.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use backhaul_control::Tunnel;
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Cap on the upstream response head; anything larger is not a handshake
const MAX_HEAD_BYTES: usize = 16 * 1024;

pub async fn proxy_upgrade(tunnel: Arc<Tunnel>, mut req: Request) -> Response {
    let Some(target) = tunnel.proxy_target() else {
        debug!(tunnel_id = %tunnel.id(), "upgrade rejected, no proxy target registered");
        return (StatusCode::BAD_GATEWAY, "No proxy target registered").into_response();
    };

    // Take the client's upgrade handle before the request is consumed
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut upstream = match TcpStream::connect(target.authority()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to reach proxy target");
            return (StatusCode::BAD_GATEWAY, "Proxy target unreachable").into_response();
        }
    };

    let head = encode_request_head(&req, &target.authority());
    if let Err(e) = upstream.write_all(&head).await {
        warn!(target = %target, error = %e, "failed to forward upgrade request");
        return (StatusCode::BAD_GATEWAY, "Proxy target unreachable").into_response();
    }

    let (status, headers, leftover) = match read_response_head(&mut upstream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(target = %target, error = %e, "invalid handshake response from target");
            return (StatusCode::BAD_GATEWAY, "Invalid response from proxy target")
                .into_response();
        }
    };

    let response = build_handshake_response(status, &headers);
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(target = %target, status, "target refused the upgrade");
        return response;
    }

    // Bridge once the client connection has actually switched protocols
    let tunnel_id = tunnel.id().to_string();
    tokio::spawn(async move {
        let upgraded = match client_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(tunnel_id = %tunnel_id, error = %e, "client upgrade never completed");
                return;
            }
        };
        let mut client_io = TokioIo::new(upgraded);

        // Bytes the target sent past its handshake head belong to the client
        if !leftover.is_empty() {
            if let Err(e) = client_io.write_all(&leftover).await {
                debug!(tunnel_id = %tunnel_id, error = %e, "client write failed");
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
            Ok((to_target, to_client)) => {
                debug!(tunnel_id = %tunnel_id, to_target, to_client, "pass-through ended");
            }
            Err(e) => {
                debug!(tunnel_id = %tunnel_id, error = %e, "pass-through aborted");
            }
        }
    });

    response
}

/// Re-serialize the client's request head for the target, rewriting `Host`
/// to the target authority (the client addressed the relay, not the target).
fn encode_request_head<B>(req: &axum::http::Request<B>, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    head.extend_from_slice(b"Host: ");
    head.extend_from_slice(authority.as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in req.headers() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read and parse the target's response head; returns status, headers, and
/// whatever bytes arrived past the head.
async fn read_response_head(
    stream: &mut TcpStream,
) -> std::io::Result<(u16, Vec<(String, String)>, Bytes)> {
    use std::io::{Error, ErrorKind};

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::new(ErrorKind::InvalidData, "response head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "empty response head"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "bad status line"))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::new(ErrorKind::InvalidData, "bad header line"));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let leftover = Bytes::copy_from_slice(&buf[head_end + 4..]);
    Ok((status, headers, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Relay the target's handshake verdict back to the client
fn build_handshake_response(status: u16, headers: &[(String, String)]) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        response.headers_mut().append(name, value);
    }

    response
}
