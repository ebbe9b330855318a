//! Request/response envelopes and agent control messages
//!
//! Everything on the tunnel connection is JSON text. The relay sends
//! `RequestEnvelope`s tagged with a correlation id (`rid`); the agent sends
//! back `ResponseEnvelope`s carrying the matching `rid`, or a control message
//! tagged with a `type` field. Bodies are base64-encoded because the
//! transport is a text channel; a request or response with no body bytes is
//! encoded as `null`, and `null` decodes to an empty body.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header mapping as it appears on the wire: name -> value or list of values
pub type Headers = BTreeMap<String, HeaderValues>;

/// One or many values for a single header name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    /// Iterate over all values regardless of representation
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        match self {
            HeaderValues::One(value) => std::slice::from_ref(value).iter(),
            HeaderValues::Many(values) => values.iter(),
        }
    }

    /// Append an additional value, promoting to the list form if needed
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValues::One(first) => {
                *self = HeaderValues::Many(vec![std::mem::take(first), value]);
            }
            HeaderValues::Many(values) => values.push(value),
        }
    }
}

/// Request sent relay -> agent for one external HTTP call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique among the tunnel's in-flight requests
    pub rid: String,
    pub method: String,
    /// Request path including the query string
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

/// Response sent agent -> relay, matched to a request by `rid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub rid: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

impl ResponseEnvelope {
    /// Status code with the protocol default applied
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(200)
    }
}

/// Control messages the agent may send outside the correlation protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Advertises a plain-proxy target for byte-level pass-through
    Register { target: String },
}

/// Any inbound message from the agent, distinguished by shape:
/// control messages carry a `type` tag, responses carry a `rid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentMessage {
    Control(ControlMessage),
    Response(ResponseEnvelope),
}

/// Serde helper for `Option<Vec<u8>>` as base64 string or null
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}
