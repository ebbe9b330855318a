//! Pending correlation tracker
//!
//! Tracks requests sent over one tunnel and routes the matching response
//! envelope back to the waiting caller. Each correlation id resolves exactly
//! once: success through `respond`, removal through `cancel`, or failure
//! through `fail_all` when the tunnel connection goes away (the dropped
//! senders surface as a closed-channel error on every waiting receiver).

use backhaul_proto::ResponseEnvelope;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Per-tunnel map of correlation id -> waiting response slot
#[derive(Clone, Default)]
pub struct PendingResponses {
    slots: Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Register a new in-flight request.
    ///
    /// Must be called before the request envelope is sent so the receive
    /// loop can never observe a response for an unregistered id.
    pub fn register(&self, rid: String) -> oneshot::Receiver<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(rid, tx);
        rx
    }

    /// Deliver a response envelope to its waiting caller.
    ///
    /// Returns false if the id is unknown (stale or duplicate response) or
    /// the caller is no longer waiting; the caller of this method should
    /// discard the envelope in that case.
    pub fn respond(&self, envelope: ResponseEnvelope) -> bool {
        let Some((rid, tx)) = self.slots.remove(&envelope.rid) else {
            debug!(rid = %envelope.rid, "no pending request for response, discarding");
            return false;
        };

        if tx.send(envelope).is_err() {
            warn!(rid = %rid, "caller gone before response arrived");
            return false;
        }
        true
    }

    /// Remove a correlation without resolving it (timeout, caller gone)
    pub fn cancel(&self, rid: &str) {
        if self.slots.remove(rid).is_some() {
            debug!(rid = %rid, "cancelled pending request");
        }
    }

    /// Fail every outstanding correlation by dropping its sender.
    ///
    /// Called on tunnel close; waiting callers observe the closed channel
    /// and report the tunnel as gone instead of hanging.
    pub fn fail_all(&self) {
        let outstanding = self.slots.len();
        if outstanding > 0 {
            debug!(outstanding, "failing all pending requests");
        }
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::Headers;

    fn response(rid: &str, status: u16) -> ResponseEnvelope {
        ResponseEnvelope {
            rid: rid.to_string(),
            status: Some(status),
            headers: Headers::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending = PendingResponses::new();
        let rx = pending.register("r-1".to_string());
        assert_eq!(pending.len(), 1);

        assert!(pending.respond(response("r-1", 200)));
        assert_eq!(pending.len(), 0);

        let received = rx.await.unwrap();
        assert_eq!(received.status_code(), 200);
    }

    #[tokio::test]
    async fn test_unknown_rid_is_discarded() {
        let pending = PendingResponses::new();
        let _rx = pending.register("r-1".to_string());

        assert!(!pending.respond(response("r-999", 200)));
        assert_eq!(pending.len(), 1, "unrelated correlation must survive");
    }

    #[tokio::test]
    async fn test_respond_resolves_exactly_once() {
        let pending = PendingResponses::new();
        let rx = pending.register("r-1".to_string());

        assert!(pending.respond(response("r-1", 200)));
        assert!(!pending.respond(response("r-1", 500)));

        assert_eq!(rx.await.unwrap().status_code(), 200);
    }

    #[tokio::test]
    async fn test_cancel_removes_without_resolving() {
        let pending = PendingResponses::new();
        let rx = pending.register("r-1".to_string());

        pending.cancel("r-1");
        assert!(pending.is_empty());
        assert!(rx.await.is_err());

        // Cancelling again is a no-op
        pending.cancel("r-1");
    }

    #[tokio::test]
    async fn test_fail_all_closes_every_waiter() {
        let pending = PendingResponses::new();
        let receivers: Vec<_> = (0..5)
            .map(|i| pending.register(format!("r-{}", i)))
            .collect();

        pending.fail_all();
        assert!(pending.is_empty());

        for rx in receivers {
            assert!(rx.await.is_err(), "waiter left dangling");
        }
    }

    #[tokio::test]
    async fn test_respond_with_dropped_receiver() {
        let pending = PendingResponses::new();
        let rx = pending.register("r-1".to_string());
        drop(rx);

        assert!(!pending.respond(response("r-1", 200)));
        assert!(pending.is_empty());
    }
}
