//! Engine error types

use std::time::Duration;

use ticketsync_shared::{MessageId, PayloadError, TicketId};

/// Failure reported by the push channel collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Channel is closed")]
    Closed,
    #[error("Channel rejected the request: {0}")]
    Rejected(String),
    #[error("Channel I/O failure: {0}")]
    Io(String),
}

/// Failure reported by the bulk-load collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Bulk load request failed: {0}")]
    Request(String),
    #[error("Bulk load response could not be decoded: {0}")]
    Decode(String),
}

/// Failure reading or writing the draft key-value resource
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Draft storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Draft serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Draft storage lock poisoned")]
    Poisoned,
}

/// Application error type for engine operations
///
/// Every send-related variant names the placeholder that was flipped to
/// `failed`, so callers can offer an explicit re-send.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    // Send failures
    #[error("Channel is not connected")]
    NotConnected { message_id: MessageId },
    #[error("No acknowledgment within {timeout:?}")]
    AckTimeout {
        message_id: MessageId,
        timeout: Duration,
    },
    #[error("Send rejected: {reason}")]
    SendRejected {
        message_id: MessageId,
        reason: String,
    },
    #[error("Send failed: {source}")]
    SendFailed {
        message_id: MessageId,
        #[source]
        source: TransportError,
    },
    #[error("Acknowledgment payload is invalid: {source}")]
    InvalidAck {
        message_id: MessageId,
        #[source]
        source: PayloadError,
    },
    #[error("Send task was aborted")]
    Aborted { message_id: MessageId },

    // Timeline lookups
    #[error("Message {message_id} not found on ticket {ticket_id}")]
    UnknownMessage {
        ticket_id: TicketId,
        message_id: MessageId,
    },
    #[error("Message {message_id} is not a failed placeholder")]
    NotRetryable { message_id: MessageId },
}

impl EngineError {
    /// Placeholder id carried by a send failure
    pub fn message_id(&self) -> &MessageId {
        match self {
            EngineError::NotConnected { message_id }
            | EngineError::AckTimeout { message_id, .. }
            | EngineError::SendRejected { message_id, .. }
            | EngineError::SendFailed { message_id, .. }
            | EngineError::InvalidAck { message_id, .. }
            | EngineError::Aborted { message_id }
            | EngineError::UnknownMessage { message_id, .. }
            | EngineError::NotRetryable { message_id } => message_id,
        }
    }

    /// Returns true if the caller may re-send the failed placeholder
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NotConnected { .. }
            | EngineError::AckTimeout { .. }
            | EngineError::SendFailed { .. }
            | EngineError::Aborted { .. } => true,

            EngineError::SendRejected { .. }
            | EngineError::InvalidAck { .. }
            | EngineError::UnknownMessage { .. }
            | EngineError::NotRetryable { .. } => false,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
