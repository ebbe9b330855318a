//! A single connected agent and its correlation protocol
//!
//! The connection handler (transport side) owns the socket; the `Tunnel`
//! owns everything the rest of the relay needs: an outbound frame channel to
//! the socket writer task, the pending correlation map, the validated
//! plain-proxy target, and the shutdown signal.

use crate::error::RelayError;
use crate::pending::PendingResponses;
use backhaul_proto::{AgentMessage, ControlMessage, ProxyTarget, RequestEnvelope, ResponseEnvelope};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct Tunnel {
    id: String,
    /// Fresh per connection; lets a reconnect's cleanup be told apart from
    /// the connection it replaced
    connection_id: String,
    /// Serialized frames to the socket writer task
    outbound: mpsc::Sender<String>,
    pending: PendingResponses,
    proxy_target: RwLock<Option<ProxyTarget>>,
    closed: watch::Sender<bool>,
}

impl Tunnel {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<String>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            outbound,
            pending: PendingResponses::new(),
            proxy_target: RwLock::new(None),
            closed,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Plain-proxy target, if the agent registered a valid one
    pub fn proxy_target(&self) -> Option<ProxyTarget> {
        self.proxy_target.read().unwrap().clone()
    }

    /// Watch that flips to true when the tunnel shuts down; the connection
    /// task selects on this to close a superseded socket promptly.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send one request envelope and await its correlated response.
    ///
    /// The pending slot is registered before the frame is handed to the
    /// writer, so the receive loop can never see a response for an id that
    /// is not yet registered. Every outcome removes the slot: a matching
    /// response resolves it, a timeout cancels it, and connection loss fails
    /// it through `shutdown`.
    pub async fn request(
        &self,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RelayError> {
        if self.is_closed() {
            return Err(RelayError::TunnelClosed);
        }

        let rid = envelope.rid.clone();
        let rx = self.pending.register(rid.clone());

        // A shutdown racing with the insert has already drained the map;
        // this slot would only ever resolve by timeout. Catch it here.
        if self.is_closed() {
            self.pending.cancel(&rid);
            return Err(RelayError::TunnelClosed);
        }

        let frame = serde_json::to_string(&envelope)?;

        if self.outbound.send(frame).await.is_err() {
            self.pending.cancel(&rid);
            return Err(RelayError::TunnelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::TunnelClosed),
            Err(_) => {
                self.pending.cancel(&rid);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Dispatch one inbound frame from the agent.
    ///
    /// Response envelopes resolve their correlation; an unknown rid is
    /// discarded silently. A `register` control message validates the
    /// advertised target; `InvalidTarget` propagates so the connection
    /// handler closes the socket. Undecodable frames return
    /// `MalformedEnvelope` and leave the connection up.
    pub fn handle_message(&self, raw: &str) -> Result<(), RelayError> {
        match serde_json::from_str::<AgentMessage>(raw)? {
            AgentMessage::Response(envelope) => {
                let rid = envelope.rid.clone();
                if !self.pending.respond(envelope) {
                    debug!(tunnel_id = %self.id, rid = %rid, "discarding response with unknown rid");
                }
                Ok(())
            }
            AgentMessage::Control(ControlMessage::Register { target }) => {
                let parsed =
                    ProxyTarget::parse(&target).map_err(|source| RelayError::InvalidTarget {
                        target: target.clone(),
                        source,
                    })?;
                info!(tunnel_id = %self.id, target = %parsed, "registered proxy target");
                *self.proxy_target.write().unwrap() = Some(parsed);
                Ok(())
            }
        }
    }

    /// Tear the tunnel down: marks it closed, fails every pending
    /// correlation, and signals the connection task. Idempotent.
    pub fn shutdown(&self) {
        if !self.closed.send_replace(true) {
            self.pending.fail_all();
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::Headers;

    fn request_envelope(rid: &str, path: &str) -> RequestEnvelope {
        RequestEnvelope {
            rid: rid.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    fn response_frame(rid: &str, body: &[u8]) -> String {
        serde_json::to_string(&ResponseEnvelope {
            rid: rid.to_string(),
            status: Some(200),
            headers: Headers::new(),
            body: Some(body.to_vec()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_resolves_matching_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let echo = tunnel.clone();
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let envelope: RequestEnvelope = serde_json::from_str(&frame).unwrap();
            assert_eq!(envelope.method, "GET");
            assert_eq!(envelope.path, "/foo");
            echo.handle_message(&response_frame(&envelope.rid, b"hi"))
                .unwrap();
        });

        let response = tunnel
            .request(request_envelope("r-1", "/foo"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.body.as_deref(), Some(b"hi".as_slice()));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        // Agent side: gather all envelopes, then reply in reverse order
        let agent = tunnel.clone();
        tokio::spawn(async move {
            let mut envelopes = Vec::new();
            for _ in 0..3 {
                let frame = rx.recv().await.unwrap();
                envelopes.push(serde_json::from_str::<RequestEnvelope>(&frame).unwrap());
            }
            for envelope in envelopes.into_iter().rev() {
                agent
                    .handle_message(&response_frame(&envelope.rid, envelope.path.as_bytes()))
                    .unwrap();
            }
        });

        let (a, b, c) = tokio::join!(
            tunnel.request(request_envelope("r-a", "/a"), Duration::from_secs(1)),
            tunnel.request(request_envelope("r-b", "/b"), Duration::from_secs(1)),
            tunnel.request(request_envelope("r-c", "/c"), Duration::from_secs(1)),
        );

        assert_eq!(a.unwrap().body.unwrap(), b"/a");
        assert_eq!(b.unwrap().body.unwrap(), b"/b");
        assert_eq!(c.unwrap().body.unwrap(), b"/c");
    }

    #[tokio::test]
    async fn test_unknown_rid_resolves_nothing() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let pending = tunnel.pending.register("r-live".to_string());
        tunnel
            .handle_message(&response_frame("r-stale", b"late"))
            .unwrap();

        assert_eq!(tunnel.pending_count(), 1);
        drop(pending);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let waiting = tunnel.clone();
        let call = tokio::spawn(async move {
            waiting
                .request(request_envelope("r-1", "/slow"), Duration::from_secs(5))
                .await
        });

        // Let the request register before tearing down
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        tunnel.shutdown();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(RelayError::TunnelClosed)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails_immediately() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);
        tunnel.shutdown();

        let result = tunnel
            .request(request_envelope("r-1", "/"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RelayError::TunnelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_racing_a_request_reports_closed_not_timeout() {
        for _ in 0..100 {
            let (tx, _outbound) = mpsc::channel(8);
            let tunnel = Tunnel::new("abc", tx);

            let caller = tunnel.clone();
            let call = tokio::spawn(async move {
                caller
                    .request(request_envelope("r-1", "/"), Duration::from_secs(1))
                    .await
            });
            let closer = tunnel.clone();
            let close = tokio::spawn(async move { closer.shutdown() });

            let result = call.await.unwrap();
            assert!(
                matches!(result, Err(RelayError::TunnelClosed)),
                "racing shutdown must report a closed tunnel, got {:?}",
                result
            );
            close.await.unwrap();
            assert_eq!(tunnel.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_request_with_dropped_writer_fails() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let tunnel = Tunnel::new("abc", tx);

        let result = tunnel
            .request(request_envelope("r-1", "/"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RelayError::TunnelClosed)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let result = tunnel
            .request(request_envelope("r-1", "/"), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(RelayError::Timeout)));
        assert_eq!(tunnel.pending_count(), 0, "timed-out slot must be removed");
    }

    #[tokio::test]
    async fn test_register_control_sets_target() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);
        assert!(tunnel.proxy_target().is_none());

        tunnel
            .handle_message(r#"{"type":"register","target":"http://localhost:3000"}"#)
            .unwrap();

        let target = tunnel.proxy_target().unwrap();
        assert_eq!(target.authority(), "localhost:3000");
    }

    #[tokio::test]
    async fn test_disallowed_target_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let result =
            tunnel.handle_message(r#"{"type":"register","target":"http://evil.example:80"}"#);
        assert!(matches!(result, Err(RelayError::InvalidTarget { .. })));
        assert!(tunnel.proxy_target().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_without_closing() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);

        let result = tunnel.handle_message("{nonsense");
        assert!(matches!(result, Err(RelayError::MalformedEnvelope(_))));
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_signals_subscriber() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("abc", tx);
        let mut shutdown = tunnel.subscribe_shutdown();

        tunnel.shutdown();
        shutdown.wait_for(|closed| *closed).await.unwrap();
        assert!(tunnel.is_closed());

        // Idempotent
        tunnel.shutdown();
    }
}
