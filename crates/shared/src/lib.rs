//! Ticket Sync Shared Types
//!
//! This crate contains the conversation model shared by the sync engine and
//! anything that talks to it: identifiers, messages, delivery status and the
//! loosely-typed wire form that the channel and bulk-load collaborators return.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
