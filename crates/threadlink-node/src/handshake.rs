//! Automatic trust handshakes between a user's linked devices.
//!
//! Sending a persisted message to a device we have no established trust
//! with replaces that message with a fixed-content handshake. Its state
//! moves `PendingSend → RequestSent | None` once the transport settles, then
//! to `Established` on link authorization or `Expired` after the expiry.

use std::sync::Arc;
use std::time::Duration;

use threadlink_protocol::{
    now_ms, HandshakeState, Identity, MessageKind, OutgoingEnvelope, OutgoingMessage, ThreadRef,
    HANDSHAKE_BODY,
};
use threadlink_storage::Storage;
use tokio::sync::oneshot;

use crate::services::{MessageSender, SendError};

/// What the router should do for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeDecision {
    /// Trust exists or the message does not need it.
    SendOriginal,
    /// Substitute an auto-generated handshake.
    SendHandshake,
    /// A handshake to this device is already outstanding; skip it.
    AlreadyPending,
}

#[derive(Clone)]
pub struct AutoHandshakeGenerator {
    storage: Arc<dyn Storage>,
    expiry: Duration,
}

impl AutoHandshakeGenerator {
    pub fn new(storage: Arc<dyn Storage>, expiry: Duration) -> Self {
        Self { storage, expiry }
    }

    pub fn decide(
        &self,
        identity: &str,
        message: &OutgoingMessage,
    ) -> threadlink_storage::Result<HandshakeDecision> {
        if message.kind.is_handshake() || !message.kind.should_be_saved() {
            return Ok(HandshakeDecision::SendOriginal);
        }
        let (state, expires_at) = match self.storage.contact_thread(identity)? {
            Some(thread) => (thread.handshake_state, thread.handshake_expires_at),
            None => (HandshakeState::None, None),
        };
        // A sent request past its expiry counts as expired even before
        // `expire_stale` has swept it.
        let lapsed = state == HandshakeState::RequestSent
            && expires_at.is_some_and(|at| at <= now_ms());
        Ok(if state.is_established() {
            HandshakeDecision::SendOriginal
        } else if state.is_outstanding() && !lapsed {
            HandshakeDecision::AlreadyPending
        } else {
            HandshakeDecision::SendHandshake
        })
    }

    /// Record that trust with `identity` is established, creating a hidden
    /// conversation if none exists.
    pub fn mark_established(&self, identity: &str) -> threadlink_storage::Result<()> {
        self.storage.get_or_create_contact_thread(identity, true)?;
        self.storage
            .write_handshake_state(identity, HandshakeState::Established, None)?;
        tracing::debug!(identity = %identity, "handshake: established");
        Ok(())
    }

    /// Prepare a handshake for `identity` and lock its conversation in
    /// `PendingSend`. `hidden` applies only if the conversation is created
    /// here. The returned delivery performs the send.
    pub fn build_handshake_send(
        &self,
        identity: &str,
        hidden: bool,
    ) -> threadlink_storage::Result<(OutgoingMessage, HandshakeDelivery)> {
        let thread = self.storage.get_or_create_contact_thread(identity, hidden)?;
        let message = OutgoingMessage::new(
            identity,
            ThreadRef::Contact(identity.to_string()),
            MessageKind::Handshake,
            HANDSHAKE_BODY.as_bytes().to_vec(),
        );
        self.storage
            .write_handshake_state(identity, HandshakeState::PendingSend, None)?;

        tracing::debug!(identity = %identity, thread = thread.id, "handshake: pending send");

        let envelope = OutgoingEnvelope::for_destination(&message, identity, thread.id);
        let delivery = HandshakeDelivery {
            identity: identity.to_string(),
            envelope,
            storage: self.storage.clone(),
            expiry: self.expiry,
            settled: None,
        };
        Ok((message, delivery))
    }

    /// Mark every `RequestSent` handshake whose expiry is at or before
    /// `now_ms` as `Expired`. Returns the affected identities.
    pub fn expire_stale(&self, now_ms: i64) -> threadlink_storage::Result<Vec<Identity>> {
        let mut expired = Vec::new();
        for thread in self.storage.list_handshakes(HandshakeState::RequestSent)? {
            let Some(expires_at) = thread.handshake_expires_at else {
                continue;
            };
            if expires_at <= now_ms
                && self
                    .storage
                    .write_handshake_state(&thread.peer, HandshakeState::Expired, None)?
            {
                expired.push(thread.peer);
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "handshake: expired stale requests");
        }
        Ok(expired)
    }
}

/// A prepared handshake send. Consumed by [`HandshakeDelivery::send`].
pub struct HandshakeDelivery {
    identity: Identity,
    envelope: OutgoingEnvelope,
    storage: Arc<dyn Storage>,
    expiry: Duration,
    settled: Option<oneshot::Sender<HandshakeState>>,
}

impl HandshakeDelivery {
    pub fn envelope(&self) -> &OutgoingEnvelope {
        &self.envelope
    }

    /// Receive the handshake state once the post-send transition is stored.
    pub fn on_settled(&mut self) -> oneshot::Receiver<HandshakeState> {
        let (tx, rx) = oneshot::channel();
        self.settled = Some(tx);
        rx
    }

    /// Send through `sender`. The state transition runs on its own task so
    /// the caller gets the transport result without waiting for storage.
    pub async fn send(self, sender: &dyn MessageSender) -> Result<(), SendError> {
        let result = sender.send(self.envelope.clone()).await;

        let (next, expires_at) = match &result {
            Ok(()) => (
                HandshakeState::RequestSent,
                Some(now_ms() + self.expiry.as_millis() as i64),
            ),
            Err(_) => (HandshakeState::None, None),
        };

        let HandshakeDelivery {
            identity,
            storage,
            settled,
            ..
        } = self;
        tokio::spawn(async move {
            match storage.write_handshake_state(&identity, next, expires_at) {
                Ok(_) => tracing::debug!(identity = %identity, state = next.as_str(), "handshake: settled"),
                Err(e) => tracing::warn!(identity = %identity, error = %e, "handshake: failed to store state"),
            }
            if let Some(tx) = settled {
                let _ = tx.send(next);
            }
        });

        result
    }
}
