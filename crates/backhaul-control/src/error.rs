//! Relay error taxonomy

use backhaul_proto::TargetError;
use thiserror::Error;

/// Errors surfaced by the tunnel core
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing tunnel id")]
    MissingId,

    #[error("tunnel not connected: {0}")]
    UnknownTunnel(String),

    #[error("missing tunnel cookie")]
    MissingCookie,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("timed out waiting for agent response")]
    Timeout,

    #[error("disallowed proxy target '{target}': {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: TargetError,
    },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}
