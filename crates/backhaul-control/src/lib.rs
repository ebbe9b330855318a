//! Tunnel multiplexing core for the Backhaul relay
//!
//! Owns the registry of live agent connections, the per-tunnel
//! request/response correlation protocol, and the sticky-cookie session
//! binding that selects a tunnel for an external caller. Transport and HTTP
//! framing live elsewhere; this crate only deals in envelopes and channels.

pub mod error;
pub mod pending;
pub mod registry;
pub mod session;
pub mod tunnel;

pub use error::RelayError;
pub use pending::PendingResponses;
pub use registry::TunnelRegistry;
pub use tunnel::Tunnel;
