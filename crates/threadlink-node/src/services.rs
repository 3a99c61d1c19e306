//! External collaborators consumed by the node: directory, swarm, transport,
//! linking session and notification bus.
//!
//! Implementations live outside this crate (network clients, UI). Tests use
//! in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use threadlink_protocol::{DeviceLink, Identity, OutgoingEnvelope, RawMessageBatch, SwarmNode};
use tokio::sync::{broadcast, RwLock};

// ============================================================================
// Directory service
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    /// The directory answered but the payload could not be parsed.
    #[error("directory response could not be parsed: {0}")]
    ParsingFailed(String),
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// All links where `identity` is either the master or the slave.
    async fn fetch_device_links(&self, identity: &str) -> Result<Vec<DeviceLink>, DirectoryError>;
    async fn remove_device_link(&self, link: &DeviceLink) -> Result<(), DirectoryError>;
}

// ============================================================================
// Swarm client
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SwarmError {
    #[error("no swarm nodes available")]
    InsufficientNodes,
    #[error("polling canceled")]
    Canceled,
    #[error("swarm transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait SwarmClient: Send + Sync {
    async fn get_swarm(&self, group_id: &str) -> Result<Vec<SwarmNode>, SwarmError>;
    async fn get_raw_messages(
        &self,
        node: &SwarmNode,
        group_id: &str,
        cursor: Option<&str>,
    ) -> Result<RawMessageBatch, SwarmError>;
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, envelope: OutgoingEnvelope) -> Result<(), SendError>;
}

// ============================================================================
// Linking session
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkingError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unexpected device {0}")]
    UnexpectedDevice(Identity),
    #[error("linking failed: {0}")]
    Failed(String),
}

/// One in-progress device-link negotiation, owned by the application.
#[async_trait]
pub trait LinkingSession: Send + Sync {
    async fn process_linking_request(
        &self,
        slave: &str,
        master: &str,
        slave_signature: &[u8],
    ) -> Result<(), LinkingError>;

    async fn process_linking_authorization(
        &self,
        master: &str,
        slave: &str,
        master_signature: &[u8],
        slave_signature: &[u8],
    ) -> Result<(), LinkingError>;
}

/// Holds at most one active linking session.
#[derive(Clone, Default)]
pub struct LinkingSessionSlot {
    inner: Arc<RwLock<Option<Arc<dyn LinkingSession>>>>,
}

impl LinkingSessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session. Returns false if one is already active.
    pub async fn begin(&self, session: Arc<dyn LinkingSession>) -> bool {
        let mut slot = self.inner.write().await;
        if slot.is_some() {
            tracing::warn!("linking: session already active, refusing a second one");
            return false;
        }
        *slot = Some(session);
        tracing::info!("linking: session started");
        true
    }

    pub async fn end(&self) {
        if self.inner.write().await.take().is_some() {
            tracing::info!("linking: session ended");
        }
    }

    pub async fn current(&self) -> Option<Arc<dyn LinkingSession>> {
        self.inner.read().await.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.is_some()
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A slave asked to link while no session was open; the app decides.
    UnexpectedLinkRequest { master: Identity, slave: Identity },
    /// The master unlinked this device; local data must be wiped.
    DataWipeRequested,
}

/// Fire-and-forget signal sink.
pub trait NotificationBus: Send + Sync {
    fn post(&self, notification: Notification);
}

/// [`NotificationBus`] backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifications {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifications {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationBus for BroadcastNotifications {
    fn post(&self, notification: Notification) {
        if self.tx.send(notification.clone()).is_err() {
            tracing::trace!(?notification, "notification dropped, no subscribers");
        }
    }
}
