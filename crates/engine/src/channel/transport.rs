//! Collaborator contracts for the push channel and the bulk-load endpoint
//!
//! The engine never speaks a wire protocol itself. A websocket client, a test
//! double or anything else that can satisfy these traits plugs in here.

use async_trait::async_trait;
use ticketsync_shared::{IncomingMessage, TicketId};

use super::events::{ChannelCommand, SendMessagePayload};
use crate::error::{LoadError, TransportError};

/// Persistent push channel
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open the channel; resolves once the remote side acknowledged it
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the channel
    async fn close(&self);

    /// Emit a fire-and-forget command
    async fn emit(&self, command: ChannelCommand) -> Result<(), TransportError>;

    /// Submit `message:send` and wait for the acknowledgment carrying the
    /// server's copy of the message
    async fn send_message(
        &self,
        payload: SendMessagePayload,
    ) -> Result<IncomingMessage, TransportError>;
}

/// Request/response bulk load of a ticket's full timeline.
///
/// Must be idempotent: it backs both the initial load and every poll.
#[async_trait]
pub trait MessageLoader: Send + Sync {
    async fn load_messages(&self, ticket_id: &TicketId) -> Result<Vec<IncomingMessage>, LoadError>;
}
