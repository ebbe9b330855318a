//! Wire protocol for the Backhaul relay
//!
//! Defines the JSON envelopes exchanged between the relay and connected
//! agents over the persistent tunnel connection, plus validation of
//! agent-advertised plain-proxy targets.

pub mod envelope;
pub mod target;

pub use envelope::{
    AgentMessage, ControlMessage, HeaderValues, Headers, RequestEnvelope, ResponseEnvelope,
};
pub use target::{ProxyTarget, TargetError};
