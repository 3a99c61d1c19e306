//! Swarm payloads and inbound envelope decoding.
//!
//! A swarm node returns opaque payloads for a group. Each payload is a
//! JSON-encoded [`InboundEnvelope`]; anything that fails to decode is
//! reported to the caller, which logs and skips it.

use serde::{Deserialize, Serialize};

use crate::{GroupId, Identity, ProtocolError, CURRENT_ERA, ENVELOPE_VERSION_MAX, ENVELOPE_VERSION_MIN};

/// A storage node in a group's swarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmNode {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl std::fmt::Display for SwarmNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One undecoded message as stored by a swarm node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Server-assigned hash, doubles as the polling cursor.
    pub hash: String,
    pub data: Vec<u8>,
    #[serde(default)]
    pub expiration_ms: Option<i64>,
}

/// Result of one `get_raw_messages` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessageBatch {
    pub messages: Vec<RawMessage>,
    /// Cursor to pass on the next request (hash of the newest message).
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Normalized inbound envelope handed to the receive pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub version: u16,
    pub source: Identity,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub timestamp_ms: i64,
    pub content: Vec<u8>,
    /// Hash of the raw swarm message this envelope came from.
    #[serde(default)]
    pub server_hash: Option<String>,
}

/// Decode a raw swarm payload into an [`InboundEnvelope`].
pub fn decode_envelope(raw: &RawMessage) -> Result<InboundEnvelope, ProtocolError> {
    let max = CURRENT_ERA.max_envelope_bytes;
    if raw.data.len() > max {
        return Err(ProtocolError::PayloadTooLarge {
            size: raw.data.len(),
            max,
        });
    }

    let mut envelope: InboundEnvelope = serde_json::from_slice(&raw.data)?;

    if envelope.version < ENVELOPE_VERSION_MIN || envelope.version > ENVELOPE_VERSION_MAX {
        return Err(ProtocolError::UnsupportedVersion {
            got: envelope.version,
            min: ENVELOPE_VERSION_MIN,
            max: ENVELOPE_VERSION_MAX,
        });
    }
    if envelope.source.is_empty() {
        return Err(ProtocolError::MissingField("source"));
    }

    envelope.server_hash = Some(raw.hash.clone());
    Ok(envelope)
}
