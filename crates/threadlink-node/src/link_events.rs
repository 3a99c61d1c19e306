//! Inbound device-link control messages and unlink requests.
//!
//! Link requests and authorizations are handed to the active linking
//! session; nothing here authorizes a link by itself.

use std::sync::Arc;
use std::time::Duration;

use threadlink_protocol::{DeviceLink, DeviceLinkMessage, Identity, LinkIntent, LinkedDevice};
use threadlink_storage::Storage;

use crate::device_links::DeviceLinkCache;
use crate::handshake::AutoHandshakeGenerator;
use crate::services::{DirectoryService, LinkingSessionSlot, Notification, NotificationBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventOutcome {
    /// A link request was handed to the active session.
    RequestForwarded,
    /// The session refused the request.
    RequestRejected(String),
    /// No session was active; the app was notified.
    UnexpectedRequestNotified,
    /// The session accepted an authorization.
    Authorized { profile_applied: bool },
    /// The session refused an authorization.
    AuthorizationRejected(String),
    /// Authorization arrived with no session to validate it.
    DroppedNoSession,
    /// A required field was missing.
    DroppedMalformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Unlinked { removed: usize },
    IgnoredNotMaster,
    IgnoredUnknownLink,
    /// The directory no longer lists the link.
    ReconciliationMismatch,
    DirectoryUnavailable(String),
}

pub struct LinkEventHandler {
    local_identity: Identity,
    sessions: LinkingSessionSlot,
    links: DeviceLinkCache,
    handshakes: AutoHandshakeGenerator,
    directory: Arc<dyn DirectoryService>,
    storage: Arc<dyn Storage>,
    notifications: Arc<dyn NotificationBus>,
    remote_view_max_age: Duration,
}

impl LinkEventHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_identity: impl Into<Identity>,
        sessions: LinkingSessionSlot,
        links: DeviceLinkCache,
        handshakes: AutoHandshakeGenerator,
        directory: Arc<dyn DirectoryService>,
        storage: Arc<dyn Storage>,
        notifications: Arc<dyn NotificationBus>,
        remote_view_max_age: Duration,
    ) -> Self {
        Self {
            local_identity: local_identity.into(),
            sessions,
            links,
            handshakes,
            directory,
            storage,
            notifications,
            remote_view_max_age,
        }
    }

    pub fn sessions(&self) -> &LinkingSessionSlot {
        &self.sessions
    }

    pub async fn handle_link_message(&self, message: &DeviceLinkMessage) -> LinkEventOutcome {
        let intent = match message.intent() {
            Ok(intent) => intent,
            Err(threadlink_protocol::ProtocolError::MissingField(field)) => {
                tracing::warn!(sender = %message.sender, field, "link: dropping malformed control message");
                return LinkEventOutcome::DroppedMalformed(field);
            }
            Err(e) => {
                tracing::warn!(sender = %message.sender, error = %e, "link: dropping control message");
                return LinkEventOutcome::DroppedMalformed("unknown");
            }
        };

        match intent {
            LinkIntent::Request {
                master,
                slave,
                slave_signature,
            } => self.handle_request(master, slave, slave_signature).await,
            LinkIntent::Authorization {
                master,
                slave,
                master_signature,
                slave_signature,
            } => {
                self.handle_authorization(message, master, slave, master_signature, slave_signature)
                    .await
            }
        }
    }

    async fn handle_request(&self, master: Identity, slave: Identity, slave_signature: Vec<u8>) -> LinkEventOutcome {
        let Some(session) = self.sessions.current().await else {
            tracing::info!(master = %master, slave = %slave, "link: request without active session");
            self.notifications
                .post(Notification::UnexpectedLinkRequest { master, slave });
            return LinkEventOutcome::UnexpectedRequestNotified;
        };

        match session
            .process_linking_request(&slave, &master, &slave_signature)
            .await
        {
            Ok(()) => {
                tracing::info!(master = %master, slave = %slave, "link: request forwarded to session");
                LinkEventOutcome::RequestForwarded
            }
            Err(e) => {
                tracing::warn!(slave = %slave, error = %e, "link: session rejected request");
                LinkEventOutcome::RequestRejected(e.to_string())
            }
        }
    }

    async fn handle_authorization(
        &self,
        message: &DeviceLinkMessage,
        master: Identity,
        slave: Identity,
        master_signature: Vec<u8>,
        slave_signature: Vec<u8>,
    ) -> LinkEventOutcome {
        let Some(session) = self.sessions.current().await else {
            tracing::info!(master = %master, slave = %slave, "link: authorization without active session, dropping");
            return LinkEventOutcome::DroppedNoSession;
        };

        if let Err(e) = session
            .process_linking_authorization(&master, &slave, &master_signature, &slave_signature)
            .await
        {
            tracing::warn!(master = %master, error = %e, "link: session rejected authorization");
            return LinkEventOutcome::AuthorizationRejected(e.to_string());
        }

        self.links
            .record_link(DeviceLink::new(
                LinkedDevice::signed(master.clone(), master_signature),
                LinkedDevice::signed(slave.clone(), slave_signature),
            ))
            .await;

        // The other side of the link is now a trusted device
        let counterpart = if self.local_identity == slave { &master } else { &slave };
        if let Err(e) = self.handshakes.mark_established(counterpart) {
            tracing::warn!(identity = %counterpart, error = %e, "link: failed to record trust");
        }

        let mut profile_applied = false;
        if let Some(profile) = message.profile.as_ref().filter(|p| !p.is_empty()) {
            match self.storage.write_profile(&master, profile) {
                Ok(()) => profile_applied = true,
                Err(e) => tracing::warn!(master = %master, error = %e, "link: failed to store profile"),
            }
        }

        tracing::info!(master = %master, slave = %slave, profile_applied, "link: authorization accepted");
        LinkEventOutcome::Authorized { profile_applied }
    }

    /// Handle an unlink request from `sender`.
    ///
    /// Accepted only when `sender` is our current master, the cache holds
    /// the link, and the directory still lists it.
    pub async fn handle_unlink_request(&self, sender: &str) -> UnlinkOutcome {
        let local = self.local_identity.as_str();

        if self.links.master_of(local).await != sender {
            tracing::warn!(sender = %sender, "link: unlink request from non-master, ignoring");
            return UnlinkOutcome::IgnoredNotMaster;
        }
        if !self.links.contains_link(sender, local).await {
            tracing::warn!(sender = %sender, "link: unlink request for unknown link, ignoring");
            return UnlinkOutcome::IgnoredUnknownLink;
        }

        let view = match self.links.fetch_remote_view(local, self.remote_view_max_age).await {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "link: cannot confirm unlink");
                return UnlinkOutcome::DirectoryUnavailable(e.to_string());
            }
        };

        let matching: Vec<DeviceLink> = view.into_iter().filter(|l| l.matches(sender, local)).collect();
        if matching.is_empty() {
            tracing::warn!(sender = %sender, "link: directory no longer lists link, ignoring unlink");
            return UnlinkOutcome::ReconciliationMismatch;
        }

        let mut removed = 0;
        for link in &matching {
            match self.directory.remove_device_link(link).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(master = %sender, error = %e, "link: remote removal failed"),
            }
            self.links.evict_link(link).await;
        }

        if let Err(e) = self.storage.set_unlinked(true) {
            tracing::error!(error = %e, "link: failed to persist unlinked flag");
        }
        self.notifications.post(Notification::DataWipeRequested);

        tracing::info!(master = %sender, removed, "link: device unlinked");
        UnlinkOutcome::Unlinked { removed }
    }
}
