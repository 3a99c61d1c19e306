//! Threadlink Protocol -- shared types for multi-device routing and group polling.
//!
//! Identities are opaque public-key strings. The wire encoding of message
//! content is not defined here; raw swarm payloads are JSON envelopes.

pub mod envelope;
pub mod era;
pub mod messages;

pub use envelope::{decode_envelope, InboundEnvelope, RawMessage, RawMessageBatch, SwarmNode};
pub use era::{ProtocolEra, CURRENT_ERA, ERA_0};
pub use messages::*;

/// Public-key derived user/device address (opaque string).
pub type Identity = String;

/// Closed group identifier (the group's public key).
pub type GroupId = String;

/// Minimum supported envelope version.
pub const ENVELOPE_VERSION_MIN: u16 = 1;

/// Maximum supported envelope version.
pub const ENVELOPE_VERSION_MAX: u16 = 1;

/// Content carried by every auto-generated multi-device handshake.
pub const HANDSHAKE_BODY: &str = "Please accept to enable messages to be synced across devices";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported envelope version {got} (we support {min}-{max})")]
    UnsupportedVersion { got: u16, min: u16, max: u16 },
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
