//! Ticket room subscriptions
//!
//! Tracks which ticket rooms the agent wants to be in and which of them were
//! actually joined on the current channel session. Joins requested while the
//! channel is down are queued and replayed once it comes up; room membership
//! does not survive a reconnect, so every new session replays all of them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use ticketsync_shared::TicketId;

use super::events::ChannelCommand;
use crate::connection::{ConnectionManager, ConnectionStatus};

#[derive(Debug, Default)]
struct RegistryState {
    /// Tickets the agent asked to join, in replay order
    wanted: BTreeSet<TicketId>,
    /// Tickets whose join was emitted during `session`
    joined: HashSet<TicketId>,
    session: u64,
}

impl RegistryState {
    /// Forget joins that belonged to an earlier channel session
    fn sync_session(&mut self, session: u64) {
        if self.session != session {
            if !self.joined.is_empty() {
                tracing::debug!(
                    previous_session = self.session,
                    session,
                    dropped = self.joined.len(),
                    "Room subscriptions lost with previous session"
                );
            }
            self.joined.clear();
            self.session = session;
        }
    }
}

/// Deduplicating ticket room registry
pub struct TicketChannelRegistry {
    connection: Arc<ConnectionManager>,
    state: Mutex<RegistryState>,
}

impl TicketChannelRegistry {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Join a ticket room. Idempotent; queued while the channel is down.
    pub async fn join(&self, ticket_id: TicketId) {
        let mut state = self.state.lock().await;

        if !state.wanted.insert(ticket_id.clone()) {
            tracing::debug!(ticket_id = %ticket_id, "Ticket already joined");
            return;
        }

        let status = self.connection.status();
        state.sync_session(status.session);

        if status.state.is_connected() {
            self.emit_join(&mut state, ticket_id).await;
        } else {
            tracing::debug!(
                ticket_id = %ticket_id,
                connection = status.state.as_str(),
                "Join queued until channel connects"
            );
        }
    }

    /// Leave a ticket room, cancelling a queued join if there is one
    pub async fn leave(&self, ticket_id: &TicketId) {
        let mut state = self.state.lock().await;

        let was_wanted = state.wanted.remove(ticket_id);
        let status = self.connection.status();
        state.sync_session(status.session);
        let was_joined = state.joined.remove(ticket_id);

        if was_joined && status.state.is_connected() {
            let command = ChannelCommand::TicketLeave {
                ticket_id: ticket_id.clone(),
            };
            match self.connection.emit(command).await {
                Ok(()) => tracing::debug!(ticket_id = %ticket_id, "Left ticket room"),
                Err(e) => tracing::warn!(
                    ticket_id = %ticket_id,
                    error = %e,
                    "Failed to emit ticket:leave"
                ),
            }
        } else if was_wanted {
            tracing::debug!(ticket_id = %ticket_id, "Cancelled queued join");
        }
    }

    /// Bring room membership in line with a connection status update
    pub async fn handle_connection_status(&self, status: &ConnectionStatus) {
        let mut state = self.state.lock().await;
        state.sync_session(status.session);

        if !status.state.is_connected() || !self.connection.is_connected() {
            return;
        }

        let pending: Vec<TicketId> = state
            .wanted
            .iter()
            .filter(|t| !state.joined.contains(*t))
            .cloned()
            .collect();

        if !pending.is_empty() {
            tracing::info!(
                session = status.session,
                tickets = pending.len(),
                "Replaying ticket joins"
            );
        }

        for ticket_id in pending {
            self.emit_join(&mut state, ticket_id).await;
        }
    }

    /// Follow the connection state for the lifetime of the returned task
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut rx = self.connection.watch();

        tokio::spawn(async move {
            loop {
                let status = rx.borrow_and_update().clone();
                registry.handle_connection_status(&status).await;

                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn is_joined(&self, ticket_id: &TicketId) -> bool {
        self.state.lock().await.wanted.contains(ticket_id)
    }

    /// Tickets the agent is (or will be, once connected) subscribed to
    pub async fn joined_tickets(&self) -> Vec<TicketId> {
        self.state.lock().await.wanted.iter().cloned().collect()
    }

    pub async fn joined_count(&self) -> usize {
        self.state.lock().await.wanted.len()
    }

    async fn emit_join(&self, state: &mut RegistryState, ticket_id: TicketId) {
        let command = ChannelCommand::TicketJoin {
            ticket_id: ticket_id.clone(),
        };

        match self.connection.emit(command).await {
            Ok(()) => {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    session = state.session,
                    "Joined ticket room"
                );
                state.joined.insert(ticket_id);
            }
            Err(e) => {
                // Stays in `wanted`; the next session replays it
                tracing::warn!(ticket_id = %ticket_id, error = %e, "Failed to emit ticket:join");
            }
        }
    }
}
