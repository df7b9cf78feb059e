//! Conversation types used across the ticket sync engine

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PayloadError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Ticket ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Prefix carried by every locally generated correlation id
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Message ID wrapper
///
/// Server-assigned ids are opaque strings. Ids minted on this side for
/// optimistic placeholders start with [`LOCAL_ID_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh correlation id for an optimistic placeholder
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// User ID wrapper (agents and customers alike)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Agent,
    Client,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Agent => "agent",
            Sender::Client => "client",
            Sender::System => "system",
        }
    }
}

/// Delivery lifecycle of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is forward progress.
    ///
    /// The delivery chain is `sending < sent < delivered < read`. `failed` can
    /// be reached from `sending` (timeout, rejection) or `sent` (provider
    /// delivery failure), and a failed message can still be confirmed later
    /// when the server reports it as sent after all.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Sending, Sending) => false,
            (Sending, _) => true,
            (Sent, Delivered | Read | Failed) => true,
            (Delivered, Read) => true,
            (Failed, Sent | Delivered | Read) => true,
            _ => false,
        }
    }

    /// `sent` or further along the delivery chain
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    }
}

// =============================================================================
// Message
// =============================================================================

/// Media payload of a message, keyed by the message `type`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageMedia {
    #[default]
    Text,
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    File {
        url: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    Audio {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
        #[serde(default)]
        voice_note: bool,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
    },
}

impl MessageMedia {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageMedia::Text => "text",
            MessageMedia::Image { .. } => "image",
            MessageMedia::File { .. } => "file",
            MessageMedia::Audio { .. } => "audio",
            MessageMedia::Video { .. } => "video",
        }
    }
}

/// A validated message on a ticket timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub ticket_id: TicketId,
    pub content: String,
    pub sender: Sender,
    pub sender_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub is_internal: bool,
    #[serde(flatten)]
    pub media: MessageMedia,
    pub status: MessageStatus,
}

impl Message {
    /// Build an optimistic agent message awaiting server confirmation
    pub fn placeholder(
        ticket_id: TicketId,
        content: impl Into<String>,
        sender_name: impl Into<String>,
        is_internal: bool,
    ) -> Self {
        Self {
            id: MessageId::local(),
            ticket_id,
            content: content.into(),
            sender: Sender::Agent,
            sender_name: sender_name.into(),
            timestamp: OffsetDateTime::now_utc(),
            is_internal,
            media: MessageMedia::Text,
            status: MessageStatus::Sending,
        }
    }

    /// Same author kind, visibility and payload
    pub fn same_payload(&self, other: &Message) -> bool {
        self.sender == other.sender
            && self.is_internal == other.is_internal
            && self.content == other.content
            && self.media == other.media
    }
}

// =============================================================================
// Wire form
// =============================================================================

/// Message as delivered by the channel or the bulk-load endpoint.
///
/// Every field is optional on the wire; [`IncomingMessage::validate`] turns it
/// into a [`Message`] or explains why the entry has to be dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// RFC 3339 string or unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_internal: Option<bool>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// Which payload fields a wire entry actually carried.
///
/// `message:update` events are often partial (id, timestamp and status only);
/// fields left out must not overwrite what the timeline already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvidedFields {
    pub content: bool,
    pub sender_name: bool,
    pub media: bool,
    pub is_internal: bool,
}

impl ProvidedFields {
    pub const ALL: Self = Self {
        content: true,
        sender_name: true,
        media: true,
        is_internal: true,
    };
}

impl IncomingMessage {
    pub fn provided(&self) -> ProvidedFields {
        ProvidedFields {
            content: self.content.is_some(),
            sender_name: self.sender_name.is_some(),
            media: self.kind.is_some() || self.metadata.is_some(),
            is_internal: self.is_internal.is_some(),
        }
    }

    /// Validate an entry destined for `ticket_id`'s timeline
    pub fn validate(self, ticket_id: &TicketId) -> Result<Message, PayloadError> {
        let id = match self.id {
            Some(id) if !id.0.trim().is_empty() => id,
            _ => return Err(PayloadError::MissingId),
        };

        if let Some(actual) = self.ticket_id {
            if &actual != ticket_id {
                return Err(PayloadError::TicketMismatch {
                    id,
                    expected: ticket_id.clone(),
                    actual,
                });
            }
        }

        let timestamp = match self.timestamp {
            None | Some(Value::Null) => return Err(PayloadError::MissingTimestamp(id)),
            Some(raw) => parse_timestamp(&raw).map_err(|reason| PayloadError::InvalidTimestamp {
                id: id.clone(),
                reason,
            })?,
        };

        let kind = self.kind.unwrap_or_else(|| "text".to_string());
        let media = parse_media(&kind, self.metadata).map_err(|reason| {
            PayloadError::InvalidMetadata {
                id: id.clone(),
                kind: kind.clone(),
                reason,
            }
        })?;

        let sender = self.sender.unwrap_or(Sender::Client);

        Ok(Message {
            id,
            ticket_id: ticket_id.clone(),
            content: self.content.unwrap_or_default(),
            sender,
            sender_name: self
                .sender_name
                .unwrap_or_else(|| sender.as_str().to_string()),
            timestamp,
            is_internal: self.is_internal.unwrap_or(false),
            media,
            status: self.status.unwrap_or_default(),
        })
    }
}

impl From<&Message> for IncomingMessage {
    fn from(msg: &Message) -> Self {
        let (kind, metadata) = match serde_json::to_value(&msg.media) {
            Ok(Value::Object(mut map)) => {
                map.remove("type");
                let metadata = (!map.is_empty()).then_some(Value::Object(map));
                (msg.media.kind().to_string(), metadata)
            }
            _ => (msg.media.kind().to_string(), None),
        };

        Self {
            id: Some(msg.id.clone()),
            ticket_id: Some(msg.ticket_id.clone()),
            content: Some(msg.content.clone()),
            sender: Some(msg.sender),
            sender_name: Some(msg.sender_name.clone()),
            timestamp: msg.timestamp.format(&Rfc3339).ok().map(Value::String),
            is_internal: Some(msg.is_internal),
            kind: Some(kind),
            metadata,
            status: Some(msg.status),
        }
    }
}

fn parse_timestamp(raw: &Value) -> Result<OffsetDateTime, String> {
    match raw {
        Value::String(s) => OffsetDateTime::parse(s, &Rfc3339).map_err(|e| e.to_string()),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| format!("{n} is not an integer epoch"))?;
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
                .map_err(|e| e.to_string())
        }
        other => Err(format!("unsupported timestamp value {other}")),
    }
}

fn parse_media(kind: &str, metadata: Option<Value>) -> Result<MessageMedia, String> {
    let mut fields = match metadata {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => return Err(format!("expected an object, got {other}")),
    };

    // Text carries no media fields; ignore whatever the provider attached.
    if kind == "text" {
        return Ok(MessageMedia::Text);
    }

    fields.insert("type".to_string(), Value::String(kind.to_string()));
    serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())
}
