//! Tunnel registry
//!
//! Process-wide mapping from tunnel id to the live agent connection handle.
//! Constructed once in the composition root and handed to the HTTP and
//! upgrade handlers by clone; there is no hidden global.

use crate::tunnel::Tunnel;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
        }
    }

    /// Install the tunnel for its id, replacing any predecessor.
    ///
    /// A replaced predecessor is shut down so there is never more than one
    /// live handle per id: its pending correlations fail and its connection
    /// task is signalled to close the socket.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        let id = tunnel.id().to_string();
        let replaced = self.tunnels.insert(id.clone(), tunnel);

        if let Some(old) = replaced {
            info!(
                tunnel_id = %id,
                old_connection_id = %old.connection_id(),
                "agent reconnected, replacing previous connection"
            );
            old.shutdown();
        } else {
            info!(tunnel_id = %id, "agent connected");
        }
    }

    /// Non-blocking read of the live handle for an id
    pub fn lookup(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `id`, but only if it still belongs to the given
    /// connection. A disconnect racing with a reconnect must not evict the
    /// replacement. The removed handle is shut down so no caller hangs.
    pub fn remove(&self, id: &str, connection_id: &str) {
        let removed = self
            .tunnels
            .remove_if(id, |_, tunnel| tunnel.connection_id() == connection_id);

        match removed {
            Some((_, tunnel)) => {
                tunnel.shutdown();
                info!(tunnel_id = %id, "agent disconnected");
            }
            None => {
                debug!(tunnel_id = %id, "stale disconnect ignored, entry already replaced");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
