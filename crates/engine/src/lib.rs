//! Ticket Sync Engine
//!
//! Keeps per-ticket message timelines consistent while messages arrive from
//! three uncoordinated sources: a persistent push channel, an on-demand bulk
//! load and a periodic reconciliation poll. Also handles optimistic sends,
//! typing presence, connection recovery and draft persistence.
//!
//! # Architecture
//!
//! - **Connection**: Push channel state machine with jittered exponential backoff
//! - **Channel**: Wire events, collaborator traits and the ticket room registry
//! - **Store**: The single writer for every ticket timeline
//! - **Outbound**: Optimistic placeholders settled by acknowledgment or failure
//! - **Typing**: Debounced local typing and expiring remote typing entries
//! - **Poller**: Fixed-interval bulk loads while a ticket is open
//! - **Draft**: Per-ticket composer autosave
//! - **Engine**: Facade wiring all of the above around one event bus

pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod draft;
pub mod engine;
pub mod error;
pub mod outbound;
pub mod poller;
pub mod store;
pub mod typing;

#[cfg(test)]
mod testing;

pub use bus::{EngineEvent, EventBus};
pub use channel::{
    ChannelCommand, ChannelEvent, ChannelTransport, MessageLoader, SendMessagePayload,
    TicketChannelRegistry,
};
pub use config::{ConfigError, EngineConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use draft::{Draft, DraftBackend, DraftStore, JsonFileDraftBackend, MemoryDraftBackend};
pub use engine::{ConversationEngine, EngineStats};
pub use error::{DraftError, EngineError, EngineResult, LoadError, TransportError};
pub use outbound::OutboundSendQueue;
pub use poller::PollingFallbackScheduler;
pub use store::{MergeReport, MessageStore, PlaceholderFailure, StatusUpdate, StoreStats};
pub use typing::{TypingCoordinator, TypingEntry};
