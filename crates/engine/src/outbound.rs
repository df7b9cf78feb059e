//! Optimistic message sending
//!
//! A send inserts a `sending` placeholder right away, submits it over the
//! channel and settles it exactly once: replaced by the server copy, or
//! flipped to `failed` with the error handed back to the caller. There is no
//! queueing across disconnects and no automatic retry.

use std::sync::Arc;
use std::time::Duration;

use ticketsync_shared::{Message, MessageId, TicketId};

use crate::bus::{EngineEvent, EventBus};
use crate::channel::events::SendMessagePayload;
use crate::connection::ConnectionManager;
use crate::error::{EngineError, EngineResult, TransportError};
use crate::store::{MessageStore, PlaceholderFailure};

pub struct OutboundSendQueue {
    store: Arc<MessageStore>,
    connection: Arc<ConnectionManager>,
    bus: EventBus,
    sender_name: String,
    ack_timeout: Duration,
}

impl OutboundSendQueue {
    pub fn new(
        store: Arc<MessageStore>,
        connection: Arc<ConnectionManager>,
        bus: EventBus,
        sender_name: impl Into<String>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            store,
            connection,
            bus,
            sender_name: sender_name.into(),
            ack_timeout,
        }
    }

    /// Send a message on a ticket.
    ///
    /// Resolves with the confirmed message, or with an error naming the
    /// placeholder that is now `failed`. Dropping the returned future does
    /// not cancel the delivery; the placeholder still settles.
    pub async fn send(
        self: &Arc<Self>,
        ticket_id: TicketId,
        content: impl Into<String>,
        is_internal: bool,
    ) -> EngineResult<Message> {
        let placeholder =
            Message::placeholder(ticket_id, content, self.sender_name.clone(), is_internal);

        tracing::debug!(
            ticket_id = %placeholder.ticket_id,
            local_id = %placeholder.id,
            is_internal,
            "Sending message"
        );

        self.store.insert_placeholder(placeholder.clone()).await;
        self.spawn_delivery(placeholder).await
    }

    /// Re-send a failed placeholder with its original correlation id
    pub async fn retry(
        self: &Arc<Self>,
        ticket_id: &TicketId,
        message_id: &MessageId,
    ) -> EngineResult<Message> {
        let placeholder = self.store.reset_for_retry(ticket_id, message_id).await?;

        tracing::info!(ticket_id = %ticket_id, local_id = %message_id, "Retrying failed send");
        self.spawn_delivery(placeholder).await
    }

    async fn spawn_delivery(self: &Arc<Self>, placeholder: Message) -> EngineResult<Message> {
        let ticket_id = placeholder.ticket_id.clone();
        let local_id = placeholder.id.clone();

        let queue = Arc::clone(self);
        let delivery = tokio::spawn(async move { queue.deliver(placeholder).await });

        match delivery.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(local_id = %local_id, error = %e, "Send task did not complete");
                self.settle_failure(&ticket_id, EngineError::Aborted { message_id: local_id })
                    .await
            }
        }
    }

    async fn deliver(&self, placeholder: Message) -> EngineResult<Message> {
        let ticket_id = placeholder.ticket_id.clone();
        let local_id = placeholder.id.clone();

        if !self.connection.is_connected() {
            return self
                .settle_failure(&ticket_id, EngineError::NotConnected { message_id: local_id })
                .await;
        }

        let payload = SendMessagePayload {
            ticket_id: ticket_id.clone(),
            content: placeholder.content,
            is_internal: placeholder.is_internal,
            client_id: local_id.clone(),
        };

        let ack =
            tokio::time::timeout(self.ack_timeout, self.connection.send_message(payload)).await;

        let error = match ack {
            Ok(Ok(raw)) => match raw.validate(&ticket_id) {
                Ok(server) => {
                    return Ok(self.store.confirm_placeholder(&ticket_id, &local_id, server).await);
                }
                Err(source) => EngineError::InvalidAck {
                    message_id: local_id,
                    source,
                },
            },
            Ok(Err(TransportError::Closed)) => EngineError::NotConnected { message_id: local_id },
            Ok(Err(TransportError::Rejected(reason))) => EngineError::SendRejected {
                message_id: local_id,
                reason,
            },
            Ok(Err(source)) => EngineError::SendFailed {
                message_id: local_id,
                source,
            },
            Err(_) => EngineError::AckTimeout {
                message_id: local_id,
                timeout: self.ack_timeout,
            },
        };

        self.settle_failure(&ticket_id, error).await
    }

    /// Flip the placeholder to `failed`, unless a push already confirmed it
    async fn settle_failure(
        &self,
        ticket_id: &TicketId,
        error: EngineError,
    ) -> EngineResult<Message> {
        let local_id = error.message_id().clone();

        match self.store.fail_placeholder(ticket_id, &local_id).await {
            PlaceholderFailure::AlreadyConfirmed(message) => {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    local_id = %local_id,
                    server_id = %message.id,
                    error = %error,
                    "Send error ignored - message already confirmed by the channel"
                );
                Ok(message)
            }
            PlaceholderFailure::Failed(_) | PlaceholderFailure::Missing => {
                tracing::warn!(
                    ticket_id = %ticket_id,
                    local_id = %local_id,
                    error = %error,
                    "Send failed"
                );
                self.bus.publish(EngineEvent::SendFailed {
                    ticket_id: ticket_id.clone(),
                    message_id: local_id,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }
}
