//! Multi-device router -- fans one outgoing message out to every linked
//! device of its recipient and reports a single aggregate result.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use threadlink_protocol::{Identity, MultiDeviceDestination, OutgoingEnvelope, OutgoingMessage, ThreadRef};
use threadlink_storage::{Storage, StorageError};
use tokio::task::JoinHandle;

use crate::device_links::DeviceLinkCache;
use crate::handshake::{AutoHandshakeGenerator, HandshakeDecision};
use crate::services::{MessageSender, SendError};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("send to {destination} failed: {source}")]
    SendFailed { destination: Identity, source: SendError },
    #[error("storage error preparing send to {destination}: {source}")]
    Storage { destination: Identity, source: StorageError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationOutcome {
    Sent,
    /// An auto-generated handshake went out instead of the message.
    HandshakeSent,
    /// A handshake to this device is still outstanding; nothing was sent.
    SkippedPendingHandshake,
}

/// Per-destination results of a successful route, in settle order.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// False when the message went only to its original destination.
    pub fanned_out: bool,
    pub outcomes: Vec<(MultiDeviceDestination, DestinationOutcome)>,
}

impl DeliveryReport {
    pub fn outcome_for(&self, identity: &str) -> Option<DestinationOutcome> {
        self.outcomes
            .iter()
            .find(|(d, _)| d.identity == identity)
            .map(|(_, o)| *o)
    }
}

pub struct MultiDeviceRouter {
    links: DeviceLinkCache,
    handshakes: AutoHandshakeGenerator,
    sender: Arc<dyn MessageSender>,
    storage: Arc<dyn Storage>,
}

impl MultiDeviceRouter {
    pub fn new(
        links: DeviceLinkCache,
        handshakes: AutoHandshakeGenerator,
        sender: Arc<dyn MessageSender>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            links,
            handshakes,
            sender,
            storage,
        }
    }

    pub fn links(&self) -> &DeviceLinkCache {
        &self.links
    }

    pub fn handshakes(&self) -> &AutoHandshakeGenerator {
        &self.handshakes
    }

    /// Route `message` to every device of its recipient.
    ///
    /// All per-destination sends run concurrently and are awaited to
    /// completion. If any fail, the error returned is whichever failure
    /// settled first.
    pub async fn route_to_all_devices(&self, message: OutgoingMessage) -> Result<DeliveryReport, RouterError> {
        if message.kind.is_device_link_admin() || message.thread.is_group() {
            return self.send_direct(&message).await;
        }

        let destinations = match self.links.resolve_destinations(&message.recipient).await {
            Ok(destinations) => destinations,
            Err(e) => {
                tracing::warn!(
                    recipient = %message.recipient,
                    error = %e,
                    "router: device resolution failed, sending to original destination only"
                );
                return self.send_direct(&message).await;
            }
        };

        tracing::debug!(
            recipient = %message.recipient,
            destinations = destinations.len(),
            message_id = %message.message_id,
            "router: fanning out"
        );

        let mut sends: FuturesUnordered<_> = destinations
            .into_iter()
            .map(|destination| self.send_to(destination, &message))
            .collect();

        let mut outcomes = Vec::with_capacity(sends.len());
        let mut first_error = None;
        while let Some(result) = sends.next().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(message_id = %message.message_id, error = %e, "router: destination failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(DeliveryReport {
                fanned_out: true,
                outcomes,
            }),
        }
    }

    /// Route on a background task. The handle yields the aggregate result.
    pub fn dispatch(self: &Arc<Self>, message: OutgoingMessage) -> JoinHandle<Result<DeliveryReport, RouterError>> {
        let router = self.clone();
        tokio::spawn(async move { router.route_to_all_devices(message).await })
    }

    async fn send_direct(&self, message: &OutgoingMessage) -> Result<DeliveryReport, RouterError> {
        let recipient = message.recipient.clone();
        let storage_err = |source| RouterError::Storage {
            destination: recipient.clone(),
            source,
        };
        let thread = match &message.thread {
            ThreadRef::Group(group_id) => self.storage.get_or_create_group_thread(group_id),
            ThreadRef::Contact(identity) => self.storage.get_or_create_contact_thread(identity, false),
        }
        .map_err(storage_err)?;

        let envelope = OutgoingEnvelope::for_destination(message, &message.recipient, thread.id);
        self.sender
            .send(envelope)
            .await
            .map_err(|source| RouterError::SendFailed {
                destination: message.recipient.clone(),
                source,
            })?;

        // Our own sends count as group activity for the poll cadence
        if message.thread.is_group() {
            if let Err(e) = self.storage.record_thread_activity(thread.id, message.timestamp_ms) {
                tracing::warn!(thread = thread.id, error = %e, "router: failed to record group activity");
            }
        }

        Ok(DeliveryReport {
            fanned_out: false,
            outcomes: vec![(
                MultiDeviceDestination::master(message.recipient.clone()),
                DestinationOutcome::Sent,
            )],
        })
    }

    async fn send_to(
        &self,
        destination: MultiDeviceDestination,
        message: &OutgoingMessage,
    ) -> Result<(MultiDeviceDestination, DestinationOutcome), RouterError> {
        let storage_err = |source| RouterError::Storage {
            destination: destination.identity.clone(),
            source,
        };
        let send_err = |source| RouterError::SendFailed {
            destination: destination.identity.clone(),
            source,
        };

        // Threads for the recipient's other devices stay out of the UI
        let hidden = destination.identity != message.recipient;

        let outcome = match self
            .handshakes
            .decide(&destination.identity, message)
            .map_err(storage_err)?
        {
            HandshakeDecision::AlreadyPending => {
                tracing::debug!(destination = %destination.identity, "router: handshake outstanding, skipping");
                DestinationOutcome::SkippedPendingHandshake
            }
            HandshakeDecision::SendHandshake => {
                let (_, delivery) = self
                    .handshakes
                    .build_handshake_send(&destination.identity, hidden)
                    .map_err(storage_err)?;
                delivery.send(self.sender.as_ref()).await.map_err(send_err)?;
                DestinationOutcome::HandshakeSent
            }
            HandshakeDecision::SendOriginal => {
                let thread = self
                    .storage
                    .get_or_create_contact_thread(&destination.identity, hidden)
                    .map_err(storage_err)?;
                let envelope = OutgoingEnvelope::for_destination(message, &destination.identity, thread.id);
                self.sender.send(envelope).await.map_err(send_err)?;
                DestinationOutcome::Sent
            }
        };

        Ok((destination, outcome))
    }
}
