//! Typing presence
//!
//! Local side: the first keystroke after idle emits `typing:start`, every
//! keystroke re-arms a single stop timer, and `typing:stop` goes out once the
//! idle window passes without input.
//!
//! Remote side: each `typing:start` creates or refreshes an entry that expires
//! after a TTL. Expired entries are never returned, even before the sweeper
//! gets to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ticketsync_shared::{TicketId, UserId};

use crate::bus::{EngineEvent, EventBus};
use crate::channel::events::ChannelCommand;
use crate::connection::ConnectionManager;

/// Someone else typing in a ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub ticket_id: TicketId,
    pub user_id: UserId,
    pub user_name: String,
    pub expires_at: Instant,
}

impl TypingEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Local typing session for one ticket
struct LocalTyping {
    generation: u64,
    stop_timer: JoinHandle<()>,
}

pub struct TypingCoordinator {
    connection: Arc<ConnectionManager>,
    bus: EventBus,
    idle_window: Duration,
    remote_ttl: Duration,
    /// Our own user id; echoes of our typing are ignored
    own_user: Option<UserId>,
    local: Mutex<HashMap<TicketId, LocalTyping>>,
    remote: RwLock<HashMap<TicketId, HashMap<UserId, TypingEntry>>>,
    generation: AtomicU64,
}

impl TypingCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        bus: EventBus,
        idle_window: Duration,
        remote_ttl: Duration,
        own_user: Option<UserId>,
    ) -> Self {
        Self {
            connection,
            bus,
            idle_window,
            remote_ttl,
            own_user,
            local: Mutex::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Local typing
    // =========================================================================

    /// Record a keystroke in the composer for `ticket_id`
    pub async fn notify_local_typing(self: &Arc<Self>, ticket_id: &TicketId) {
        let mut local = self.local.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(session) = local.get_mut(ticket_id) {
            session.stop_timer.abort();
            session.generation = generation;
            session.stop_timer = self.arm_stop_timer(ticket_id.clone(), generation);
            return;
        }

        if !self.connection.is_connected() {
            return;
        }

        let command = ChannelCommand::TypingStart {
            ticket_id: ticket_id.clone(),
        };
        if let Err(e) = self.connection.emit(command).await {
            tracing::debug!(ticket_id = %ticket_id, error = %e, "Failed to emit typing:start");
            return;
        }

        tracing::debug!(ticket_id = %ticket_id, "Local typing started");
        local.insert(
            ticket_id.clone(),
            LocalTyping {
                generation,
                stop_timer: self.arm_stop_timer(ticket_id.clone(), generation),
            },
        );
    }

    /// End local typing now (message sent, composer closed)
    pub async fn stop_local_typing(&self, ticket_id: &TicketId) {
        let session = self.local.lock().await.remove(ticket_id);

        if let Some(session) = session {
            session.stop_timer.abort();
            self.emit_stop(ticket_id).await;
        }
    }

    pub async fn is_typing_locally(&self, ticket_id: &TicketId) -> bool {
        self.local.lock().await.contains_key(ticket_id)
    }

    fn arm_stop_timer(self: &Arc<Self>, ticket_id: TicketId, generation: u64) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let idle = self.idle_window;

        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.expire_local(&ticket_id, generation).await;
            }
        })
    }

    async fn expire_local(&self, ticket_id: &TicketId, generation: u64) {
        let expired = {
            let mut local = self.local.lock().await;
            match local.get(ticket_id) {
                Some(session) if session.generation == generation => {
                    local.remove(ticket_id).is_some()
                }
                _ => false,
            }
        };

        if expired {
            tracing::debug!(ticket_id = %ticket_id, "Local typing idle");
            self.emit_stop(ticket_id).await;
        }
    }

    async fn emit_stop(&self, ticket_id: &TicketId) {
        let command = ChannelCommand::TypingStop {
            ticket_id: ticket_id.clone(),
        };
        if let Err(e) = self.connection.emit(command).await {
            tracing::debug!(ticket_id = %ticket_id, error = %e, "Failed to emit typing:stop");
        }
    }

    // =========================================================================
    // Remote typing
    // =========================================================================

    /// `typing:start` from the channel
    pub fn handle_remote_start(&self, ticket_id: TicketId, user_id: UserId, user_name: String) {
        if self.own_user.as_ref() == Some(&user_id) {
            return;
        }

        let expires_at = Instant::now() + self.remote_ttl;
        let changed = match self.remote.write() {
            Ok(mut remote) => {
                let entries = remote.entry(ticket_id.clone()).or_default();
                let fresh = entries
                    .get(&user_id)
                    .map_or(true, |e| e.is_expired(Instant::now()) || e.user_name != user_name);

                entries.insert(
                    user_id.clone(),
                    TypingEntry {
                        ticket_id: ticket_id.clone(),
                        user_id,
                        user_name,
                        expires_at,
                    },
                );
                fresh
            }
            Err(_) => false,
        };

        if changed {
            self.bus.publish(EngineEvent::TypingChanged { ticket_id });
        }
    }

    /// `typing:stop` from the channel
    pub fn handle_remote_stop(&self, ticket_id: &TicketId, user_id: &UserId) {
        let removed = match self.remote.write() {
            Ok(mut remote) => {
                let removed = remote
                    .get_mut(ticket_id)
                    .and_then(|entries| entries.remove(user_id))
                    .is_some();
                if remote.get(ticket_id).is_some_and(HashMap::is_empty) {
                    remote.remove(ticket_id);
                }
                removed
            }
            Err(_) => false,
        };

        if removed {
            self.bus.publish(EngineEvent::TypingChanged {
                ticket_id: ticket_id.clone(),
            });
        }
    }

    /// Users currently typing in a ticket, ordered by name
    pub fn get_remote_typing(&self, ticket_id: &TicketId) -> Vec<TypingEntry> {
        let now = Instant::now();
        let Ok(remote) = self.remote.read() else {
            return Vec::new();
        };

        let mut typing: Vec<TypingEntry> = remote
            .get(ticket_id)
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        typing.sort_by(|a, b| {
            a.user_name
                .cmp(&b.user_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        typing
    }

    /// Remove expired remote entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut touched = Vec::new();
        let mut dropped = 0;

        if let Ok(mut remote) = self.remote.write() {
            for (ticket_id, entries) in remote.iter_mut() {
                let before = entries.len();
                entries.retain(|_, e| !e.is_expired(now));
                if entries.len() != before {
                    dropped += before - entries.len();
                    touched.push(ticket_id.clone());
                }
            }
            remote.retain(|_, entries| !entries.is_empty());
        }

        for ticket_id in touched {
            self.bus.publish(EngineEvent::TypingChanged { ticket_id });
        }
        dropped
    }

    /// Run [`sweep`](Self::sweep) every `every` until the coordinator is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Skip the first immediate tick.
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };

                let dropped = coordinator.sweep();
                if dropped > 0 {
                    tracing::debug!(dropped, "Swept expired typing entries");
                }
            }
        })
    }

    /// Forget everything typing-related for a ticket
    pub async fn clear_ticket(&self, ticket_id: &TicketId) {
        self.stop_local_typing(ticket_id).await;

        let removed = self
            .remote
            .write()
            .map(|mut remote| remote.remove(ticket_id).is_some())
            .unwrap_or(false);

        if removed {
            self.bus.publish(EngineEvent::TypingChanged {
                ticket_id: ticket_id.clone(),
            });
        }
    }

    /// Number of live remote entries across all tickets
    pub fn remote_count(&self) -> usize {
        let now = Instant::now();
        self.remote
            .read()
            .map(|remote| {
                remote
                    .values()
                    .flat_map(HashMap::values)
                    .filter(|e| !e.is_expired(now))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        for session in self.local.get_mut().values() {
            session.stop_timer.abort();
        }
    }
}
