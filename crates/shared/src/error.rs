//! Error types for ticket sync payloads

use thiserror::Error;

use crate::types::{MessageId, TicketId};

/// Reasons an incoming message entry is rejected before it reaches a timeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("message is missing an id")]
    MissingId,

    #[error("message {0} is missing a timestamp")]
    MissingTimestamp(MessageId),

    #[error("message {id} has an invalid timestamp: {reason}")]
    InvalidTimestamp { id: MessageId, reason: String },

    #[error("message {id} belongs to ticket {actual}, not {expected}")]
    TicketMismatch {
        id: MessageId,
        expected: TicketId,
        actual: TicketId,
    },

    #[error("message {id} has invalid {kind} metadata: {reason}")]
    InvalidMetadata {
        id: MessageId,
        kind: String,
        reason: String,
    },
}
