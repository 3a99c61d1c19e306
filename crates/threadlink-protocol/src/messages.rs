//! Device links, destinations and outgoing message types.

use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{GroupId, Identity};

// ============================================================================
// Device links
// ============================================================================

/// One side of a device link. The signature is opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedDevice {
    pub identity: Identity,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl LinkedDevice {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            signature: None,
        }
    }

    pub fn signed(identity: impl Into<Identity>, signature: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            signature: Some(signature),
        }
    }
}

/// An authorized pairing between a master and a slave identity.
///
/// Equality and hashing only consider the two identities, so replaying the
/// same link with different signature bytes is idempotent in a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLink {
    pub master: LinkedDevice,
    pub slave: LinkedDevice,
}

impl DeviceLink {
    pub fn new(master: LinkedDevice, slave: LinkedDevice) -> Self {
        Self { master, slave }
    }

    /// Unsigned link, used where only the pairing matters.
    pub fn between(master: impl Into<Identity>, slave: impl Into<Identity>) -> Self {
        Self::new(LinkedDevice::new(master), LinkedDevice::new(slave))
    }

    pub fn master_identity(&self) -> &str {
        &self.master.identity
    }

    pub fn slave_identity(&self) -> &str {
        &self.slave.identity
    }

    pub fn matches(&self, master: &str, slave: &str) -> bool {
        self.master.identity == master && self.slave.identity == slave
    }

    /// Whether `identity` is either side of this link.
    pub fn involves(&self, identity: &str) -> bool {
        self.master.identity == identity || self.slave.identity == identity
    }
}

impl PartialEq for DeviceLink {
    fn eq(&self, other: &Self) -> bool {
        self.master.identity == other.master.identity && self.slave.identity == other.slave.identity
    }
}

impl Eq for DeviceLink {}

impl Hash for DeviceLink {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.master.identity.hash(state);
        self.slave.identity.hash(state);
    }
}

/// A resolved delivery target for a multi-device send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiDeviceDestination {
    pub identity: Identity,
    pub is_master: bool,
}

impl MultiDeviceDestination {
    pub fn master(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            is_master: true,
        }
    }

    pub fn slave(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            is_master: false,
        }
    }
}

// ============================================================================
// Handshake state
// ============================================================================

/// Trust-establishment state of the conversation with one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    /// No handshake sent or received.
    #[default]
    None,
    /// Locks the conversation while an auto-generated handshake is being sent.
    PendingSend,
    /// Handshake delivered, awaiting acceptance.
    RequestSent,
    /// Handshake received from the other side, awaiting local acceptance.
    RequestReceived,
    /// Trust established.
    Established,
    /// Handshake sent but never accepted within the expiry window.
    Expired,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::None => "none",
            HandshakeState::PendingSend => "pending_send",
            HandshakeState::RequestSent => "request_sent",
            HandshakeState::RequestReceived => "request_received",
            HandshakeState::Established => "established",
            HandshakeState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(HandshakeState::None),
            "pending_send" => Some(HandshakeState::PendingSend),
            "request_sent" => Some(HandshakeState::RequestSent),
            "request_received" => Some(HandshakeState::RequestReceived),
            "established" => Some(HandshakeState::Established),
            "expired" => Some(HandshakeState::Expired),
            _ => None,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, HandshakeState::Established)
    }

    /// An auto-generated handshake is in flight or awaiting acceptance.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, HandshakeState::PendingSend | HandshakeState::RequestSent)
    }
}

// ============================================================================
// Outgoing messages
// ============================================================================

/// Conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ThreadRef {
    Contact(Identity),
    Group(GroupId),
}

impl ThreadRef {
    pub fn is_group(&self) -> bool {
        matches!(self, ThreadRef::Group(_))
    }
}

/// Message class. Drives both multi-device routing and handshake policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Regular visible chat message.
    Visible,
    /// Delivery/read receipt.
    Receipt,
    TypingIndicator,
    /// Trust-establishment request (manual or auto-generated).
    Handshake,
    /// Device link request or authorization.
    DeviceLink,
    /// Request from a master to unlink a slave.
    Unlink,
}

impl MessageKind {
    /// Administrative link traffic is never fanned out to linked devices.
    pub fn is_device_link_admin(&self) -> bool {
        matches!(self, MessageKind::DeviceLink | MessageKind::Unlink)
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, MessageKind::Handshake)
    }

    /// Whether the message would be persisted as a conversation entry.
    pub fn should_be_saved(&self) -> bool {
        matches!(self, MessageKind::Visible)
    }
}

/// A message queued for sending, addressed to its original destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message_id: String,
    /// Original destination identity (or group id for group threads).
    pub recipient: Identity,
    pub thread: ThreadRef,
    pub kind: MessageKind,
    pub content: Vec<u8>,
    /// Sender certificate, copied verbatim to every destination.
    #[serde(default)]
    pub certificate: Option<Vec<u8>>,
    pub timestamp_ms: i64,
    pub ttl_ms: u64,
}

/// Default message TTL (24 hours).
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

impl OutgoingMessage {
    pub fn new(recipient: impl Into<Identity>, thread: ThreadRef, kind: MessageKind, content: Vec<u8>) -> Self {
        Self {
            message_id: new_message_id(),
            recipient: recipient.into(),
            thread,
            kind,
            content,
            certificate: None,
            timestamp_ms: now_ms(),
            ttl_ms: DEFAULT_TTL_MS,
        }
    }

    /// Visible message in a one-to-one conversation.
    pub fn to_contact(recipient: impl Into<Identity>, content: impl Into<Vec<u8>>) -> Self {
        let recipient = recipient.into();
        Self::new(
            recipient.clone(),
            ThreadRef::Contact(recipient),
            MessageKind::Visible,
            content.into(),
        )
    }

    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self
    }
}

/// A per-destination delivery unit handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    pub message_id: String,
    pub recipient: Identity,
    /// Local thread the send is recorded against.
    pub thread_id: i64,
    pub kind: MessageKind,
    pub content: Vec<u8>,
    #[serde(default)]
    pub certificate: Option<Vec<u8>>,
    pub timestamp_ms: i64,
    pub ttl_ms: u64,
}

impl OutgoingEnvelope {
    /// Copy content, certificate and delivery metadata onto a new destination.
    pub fn for_destination(message: &OutgoingMessage, recipient: &str, thread_id: i64) -> Self {
        Self {
            message_id: message.message_id.clone(),
            recipient: recipient.to_string(),
            thread_id,
            kind: message.kind,
            content: message.content.clone(),
            certificate: message.certificate.clone(),
            timestamp_ms: message.timestamp_ms,
            ttl_ms: message.ttl_ms,
        }
    }
}

// ============================================================================
// Link control messages
// ============================================================================

/// Profile data a master embeds alongside a link authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub profile_key: Option<Vec<u8>>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.profile_key.is_none()
    }
}

/// Decoded device-link control envelope. Every field is optional on the
/// wire; classification decides whether it is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLinkMessage {
    /// Identity that sent the envelope.
    pub sender: Identity,
    #[serde(default)]
    pub master: Option<Identity>,
    #[serde(default)]
    pub slave: Option<Identity>,
    #[serde(default)]
    pub master_signature: Option<Vec<u8>>,
    #[serde(default)]
    pub slave_signature: Option<Vec<u8>>,
    #[serde(default)]
    pub profile: Option<ProfileUpdate>,
}

/// What a link control envelope asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkIntent {
    /// Slave asks a master to link (slave signature only).
    Request {
        master: Identity,
        slave: Identity,
        slave_signature: Vec<u8>,
    },
    /// Master authorizes a slave (both signatures).
    Authorization {
        master: Identity,
        slave: Identity,
        master_signature: Vec<u8>,
        slave_signature: Vec<u8>,
    },
}

impl DeviceLinkMessage {
    /// Classify the envelope, or name the first missing field.
    pub fn intent(&self) -> Result<LinkIntent, crate::ProtocolError> {
        use crate::ProtocolError::MissingField;

        let master = self.master.clone().ok_or(MissingField("master"))?;
        let slave = self.slave.clone().ok_or(MissingField("slave"))?;
        let slave_signature = self
            .slave_signature
            .clone()
            .ok_or(MissingField("slave_signature"))?;

        match &self.master_signature {
            None => Ok(LinkIntent::Request {
                master,
                slave,
                slave_signature,
            }),
            Some(master_signature) => Ok(LinkIntent::Authorization {
                master,
                slave,
                master_signature: master_signature.clone(),
                slave_signature,
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Random 128-bit hex message identifier.
pub fn new_message_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
