//! Channel event types and serialization
//!
//! Defines the events the push channel delivers and the commands the engine
//! emits over it, with type-safe serde serialization.

use serde::{Deserialize, Serialize};
use ticketsync_shared::{IncomingMessage, MessageId, TicketId, UserId};

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events pushed by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    /// New message on a ticket
    #[serde(rename = "message:new")]
    MessageNew {
        ticket_id: TicketId,
        message: IncomingMessage,
    },

    /// Status or content change of a known message
    #[serde(rename = "message:update")]
    MessageUpdate {
        ticket_id: TicketId,
        message: IncomingMessage,
    },

    /// Channel acknowledged the connection
    #[serde(rename = "connection:open")]
    ConnectionOpen,

    /// Channel closed
    #[serde(rename = "connection:close")]
    ConnectionClose {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Channel reported a transport error
    #[serde(rename = "connection:error")]
    ConnectionError { message: String },

    /// Someone started typing in a ticket
    #[serde(rename = "typing:start")]
    TypingStart {
        ticket_id: TicketId,
        user_id: UserId,
        user_name: String,
    },

    /// Someone stopped typing in a ticket
    #[serde(rename = "typing:stop")]
    TypingStop { ticket_id: TicketId, user_id: UserId },
}

impl ChannelEvent {
    /// Decode a raw text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            ChannelEvent::MessageNew { .. } => "message:new",
            ChannelEvent::MessageUpdate { .. } => "message:update",
            ChannelEvent::ConnectionOpen => "connection:open",
            ChannelEvent::ConnectionClose { .. } => "connection:close",
            ChannelEvent::ConnectionError { .. } => "connection:error",
            ChannelEvent::TypingStart { .. } => "typing:start",
            ChannelEvent::TypingStop { .. } => "typing:stop",
        }
    }
}

// =============================================================================
// Client-to-Server Commands
// =============================================================================

/// Fire-and-forget commands emitted over the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelCommand {
    /// Subscribe to a ticket room
    #[serde(rename = "ticket:join")]
    TicketJoin { ticket_id: TicketId },

    /// Unsubscribe from a ticket room
    #[serde(rename = "ticket:leave")]
    TicketLeave { ticket_id: TicketId },

    /// Local agent started typing
    #[serde(rename = "typing:start")]
    TypingStart { ticket_id: TicketId },

    /// Local agent stopped typing
    #[serde(rename = "typing:stop")]
    TypingStop { ticket_id: TicketId },
}

impl ChannelCommand {
    pub fn ticket_id(&self) -> &TicketId {
        match self {
            ChannelCommand::TicketJoin { ticket_id }
            | ChannelCommand::TicketLeave { ticket_id }
            | ChannelCommand::TypingStart { ticket_id }
            | ChannelCommand::TypingStop { ticket_id } => ticket_id,
        }
    }
}

/// Payload of the acknowledged `message:send` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub ticket_id: TicketId,
    pub content: String,
    pub is_internal: bool,
    /// Correlation id of the optimistic placeholder
    pub client_id: MessageId,
}

impl SendMessagePayload {
    pub const EVENT: &'static str = "message:send";
}
