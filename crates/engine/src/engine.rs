//! Engine facade
//!
//! Builds every component around one event bus and routes channel events to
//! them. Per-ticket background work is owned here and started/stopped
//! explicitly with [`ConversationEngine::start_for_ticket`] and
//! [`ConversationEngine::stop_for_ticket`].

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ticketsync_shared::{Message, MessageId, TicketId};

use crate::bus::{EngineEvent, EventBus};
use crate::channel::events::ChannelEvent;
use crate::channel::registry::TicketChannelRegistry;
use crate::channel::transport::{ChannelTransport, MessageLoader};
use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::draft::{Draft, DraftBackend, DraftStore};
use crate::error::{DraftError, EngineResult, TransportError};
use crate::outbound::OutboundSendQueue;
use crate::poller::PollingFallbackScheduler;
use crate::store::MessageStore;
use crate::typing::{TypingCoordinator, TypingEntry};

/// Snapshot of engine activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Connection state
    pub connection: ConnectionState,
    /// Tickets with a timeline in memory
    pub tickets: usize,
    /// Messages across all timelines
    pub messages: usize,
    /// Placeholders still waiting for confirmation
    pub pending_placeholders: usize,
    /// Ticket rooms joined or queued
    pub joined_tickets: usize,
    /// Tickets being polled
    pub active_pollers: usize,
    /// Remote users currently typing
    pub remote_typing: usize,
}

pub struct ConversationEngine {
    config: EngineConfig,
    bus: EventBus,
    connection: Arc<ConnectionManager>,
    registry: Arc<TicketChannelRegistry>,
    store: Arc<MessageStore>,
    outbound: Arc<OutboundSendQueue>,
    typing: Arc<TypingCoordinator>,
    poller: Arc<PollingFallbackScheduler>,
    drafts: DraftStore,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationEngine {
    /// Build the engine and its background tasks. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn ChannelTransport>,
        loader: Arc<dyn MessageLoader>,
        drafts: Arc<dyn DraftBackend>,
    ) -> Self {
        let bus = EventBus::new(config.event_buffer);

        let connection = Arc::new(ConnectionManager::new(
            transport,
            config.reconnect.clone(),
            bus.clone(),
        ));
        let registry = Arc::new(TicketChannelRegistry::new(Arc::clone(&connection)));
        let store = Arc::new(MessageStore::new(bus.clone(), config.reconciliation_window));
        let outbound = Arc::new(OutboundSendQueue::new(
            Arc::clone(&store),
            Arc::clone(&connection),
            bus.clone(),
            config.agent_name.clone(),
            config.send_ack_timeout,
        ));
        let typing = Arc::new(TypingCoordinator::new(
            Arc::clone(&connection),
            bus.clone(),
            config.typing_idle_window,
            config.remote_typing_ttl,
            config.agent_id.clone(),
        ));
        let poller = Arc::new(PollingFallbackScheduler::new(
            Arc::clone(&store),
            loader,
            bus.clone(),
            config.poll_interval,
        ));

        let background = vec![
            registry.spawn_watcher(),
            typing.spawn_sweeper(config.typing_sweep_interval),
        ];

        tracing::debug!(agent = %config.agent_name, "Conversation engine initialized");

        Self {
            config,
            bus,
            connection,
            registry,
            store,
            outbound,
            typing,
            poller,
            drafts: DraftStore::new(drafts),
            background: Mutex::new(background),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Route an event pushed by the channel
    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        tracing::trace!(event = event.event_type(), "Channel event");

        match event {
            ChannelEvent::MessageNew { ticket_id, message }
            | ChannelEvent::MessageUpdate { ticket_id, message } => {
                self.store.merge_incoming(&ticket_id, vec![message]).await;
            }
            ChannelEvent::ConnectionOpen => self.connection.handle_open(),
            ChannelEvent::ConnectionClose { reason } => {
                self.connection
                    .handle_drop(reason.unwrap_or_else(|| "connection closed".to_string()));
            }
            ChannelEvent::ConnectionError { message } => self.connection.handle_drop(message),
            ChannelEvent::TypingStart {
                ticket_id,
                user_id,
                user_name,
            } => self.typing.handle_remote_start(ticket_id, user_id, user_name),
            ChannelEvent::TypingStop { ticket_id, user_id } => {
                self.typing.handle_remote_stop(&ticket_id, &user_id)
            }
        }
    }

    /// Decode and route a raw text frame; malformed frames are dropped
    pub async fn handle_channel_frame(&self, text: &str) {
        match ChannelEvent::from_json(text) {
            Ok(event) => self.handle_channel_event(event).await,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed channel frame");
            }
        }
    }

    // =========================================================================
    // Ticket lifecycle
    // =========================================================================

    /// Open a ticket: join its room, load its timeline and start polling.
    ///
    /// A failed initial load is published as `LoadFailed` and retried by the
    /// poller; the returned timeline is whatever is known so far.
    pub async fn start_for_ticket(&self, ticket_id: &TicketId) -> Vec<Message> {
        tracing::info!(ticket_id = %ticket_id, "Starting ticket");

        self.registry.join(ticket_id.clone()).await;
        match self.poller.load_now(ticket_id).await {
            Ok(Some(report)) => {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    inserted = report.inserted,
                    "Initial load applied"
                );
            }
            Ok(None) => {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    "Initial load discarded - ticket closed meanwhile"
                );
            }
            Err(e) => {
                // Already published as LoadFailed; the poller retries
                tracing::debug!(ticket_id = %ticket_id, error = %e, "Initial load failed");
            }
        }
        self.poller.start(ticket_id.clone());

        self.store.get_timeline(ticket_id).await
    }

    /// Close a ticket: leave its room, stop polling, discard any in-flight
    /// load and drop its timeline and typing state
    pub async fn stop_for_ticket(&self, ticket_id: &TicketId) {
        tracing::info!(ticket_id = %ticket_id, "Stopping ticket");

        self.registry.leave(ticket_id).await;
        self.poller.stop(ticket_id);
        self.store.teardown(ticket_id).await;
        self.typing.clear_ticket(ticket_id).await;
    }

    pub fn timeline_is_active(&self, ticket_id: &TicketId) -> bool {
        self.poller.is_running(ticket_id)
    }

    pub async fn timeline(&self, ticket_id: &TicketId) -> Vec<Message> {
        self.store.get_timeline(ticket_id).await
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send a message. On success the ticket's draft is cleared.
    pub async fn send(
        &self,
        ticket_id: &TicketId,
        content: &str,
        is_internal: bool,
    ) -> EngineResult<Message> {
        self.typing.stop_local_typing(ticket_id).await;

        let message = self
            .outbound
            .send(ticket_id.clone(), content, is_internal)
            .await?;

        if let Err(e) = self.drafts.clear(ticket_id) {
            tracing::warn!(ticket_id = %ticket_id, error = %e, "Failed to clear draft after send");
        }
        Ok(message)
    }

    /// Re-send a failed placeholder
    pub async fn retry(
        &self,
        ticket_id: &TicketId,
        message_id: &MessageId,
    ) -> EngineResult<Message> {
        let message = self.outbound.retry(ticket_id, message_id).await?;

        if let Err(e) = self.drafts.clear(ticket_id) {
            tracing::warn!(ticket_id = %ticket_id, error = %e, "Failed to clear draft after send");
        }
        Ok(message)
    }

    // =========================================================================
    // Typing
    // =========================================================================

    pub async fn notify_typing(&self, ticket_id: &TicketId) {
        self.typing.notify_local_typing(ticket_id).await
    }

    pub fn remote_typing(&self, ticket_id: &TicketId) -> Vec<TypingEntry> {
        self.typing.get_remote_typing(ticket_id)
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    pub fn save_draft(
        &self,
        ticket_id: &TicketId,
        content: &str,
    ) -> Result<Option<Draft>, DraftError> {
        self.drafts.save(ticket_id, content)
    }

    pub fn restore_draft(&self, ticket_id: &TicketId) -> Result<Option<Draft>, DraftError> {
        self.drafts.restore(ticket_id)
    }

    pub fn discard_draft(&self, ticket_id: &TicketId) -> Result<(), DraftError> {
        self.drafts.clear(ticket_id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn stats(&self) -> EngineStats {
        let store = self.store.stats().await;

        EngineStats {
            connection: self.connection.state(),
            tickets: store.tickets,
            messages: store.messages,
            pending_placeholders: store.pending_placeholders,
            joined_tickets: self.registry.joined_count().await,
            active_pollers: self.poller.active_count(),
            remote_typing: self.typing.remote_count(),
        }
    }

    /// Stop all background work and close the channel
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down conversation engine");

        self.abort_background();
        self.poller.stop_all();
        for ticket_id in self.registry.joined_tickets().await {
            self.typing.stop_local_typing(&ticket_id).await;
        }
        self.connection.disconnect().await;
    }

    fn abort_background(&self) {
        if let Ok(mut tasks) = self.background.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.abort_background();
        self.poller.stop_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use crate::draft::MemoryDraftBackend;
    use crate::testing::{incoming, FakeLoader, FakeTransport};
    use ticketsync_shared::MessageStatus;

    fn engine(loader: Arc<FakeLoader>) -> (Arc<FakeTransport>, ConversationEngine) {
        let transport = Arc::new(FakeTransport::new());
        let engine = ConversationEngine::new(
            EngineConfig::default(),
            Arc::clone(&transport) as Arc<dyn ChannelTransport>,
            loader,
            Arc::new(MemoryDraftBackend::new()),
        );
        (transport, engine)
    }

    fn t1() -> TicketId {
        TicketId::new("T1")
    }

    #[tokio::test]
    async fn test_push_event_merges_into_timeline() {
        let (_, engine) = engine(Arc::new(FakeLoader::new(Vec::new())));
        let mut rx = engine.subscribe();

        engine
            .handle_channel_event(ChannelEvent::MessageNew {
                ticket_id: t1(),
                message: incoming("s1", "hola", 0, MessageStatus::Sent),
            })
            .await;

        assert_eq!(engine.timeline(&t1()).await.len(), 1);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::MessageReceived { .. })));
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped() {
        let (_, engine) = engine(Arc::new(FakeLoader::new(Vec::new())));

        engine.handle_channel_frame("{not json").await;
        let frame = serde_json::json!({
            "type": "message:new",
            "ticket_id": "T1",
            "message": { "content": "no id", "timestamp": "2025-03-01T10:00:00Z" },
        });
        engine.handle_channel_frame(&frame.to_string()).await;

        assert!(engine.timeline(&t1()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_ticket() {
        let loader = Arc::new(FakeLoader::new(vec![incoming("1", "hi", 0, MessageStatus::Sent)]));
        let (transport, engine) = engine(Arc::clone(&loader));
        engine.connect().await.unwrap();

        let timeline = engine.start_for_ticket(&t1()).await;
        assert_eq!(timeline.len(), 1);
        assert!(engine.timeline_is_active(&t1()));

        engine.stop_for_ticket(&t1()).await;
        let stats = engine.stats().await;
        assert_eq!(stats.active_pollers, 0);
        assert_eq!(stats.tickets, 0);
        assert_eq!(stats.joined_tickets, 0);
        assert!(transport
            .commands()
            .contains(&crate::channel::events::ChannelCommand::TicketLeave { ticket_id: t1() }));

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_load_still_starts_polling() {
        let loader = Arc::new(FakeLoader::new(Vec::new()));
        loader.set_failing(true);
        let (_, engine) = engine(Arc::clone(&loader));
        let mut rx = engine.subscribe();

        let timeline = engine.start_for_ticket(&t1()).await;

        assert!(timeline.is_empty());
        assert!(engine.timeline_is_active(&t1()));
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            saw_failure |= matches!(event, EngineEvent::LoadFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_connection_events_drive_state() {
        let (_, engine) = engine(Arc::new(FakeLoader::new(Vec::new())));
        engine.connect().await.unwrap();

        engine
            .handle_channel_event(ChannelEvent::ConnectionError {
                message: "ping timeout".to_string(),
            })
            .await;
        assert_eq!(engine.connection_state().as_str(), "reconnecting");

        engine.handle_channel_event(ChannelEvent::ConnectionOpen).await;
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (_, engine) = engine(Arc::new(FakeLoader::new(Vec::new())));
        engine.connect().await.unwrap();

        engine.shutdown().await;

        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }
}
