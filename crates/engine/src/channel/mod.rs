//! Push channel plumbing
//!
//! - **Events**: Type-safe definitions of what the channel pushes and what we emit
//! - **Transport**: Collaborator traits for the channel and the bulk-load endpoint
//! - **Registry**: Ticket room subscriptions that survive reconnects

pub mod events;
pub mod registry;
pub mod transport;

pub use events::{ChannelCommand, ChannelEvent, SendMessagePayload};
pub use registry::TicketChannelRegistry;
pub use transport::{ChannelTransport, MessageLoader};
