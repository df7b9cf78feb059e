//! Authoritative per-ticket message timelines
//!
//! Every source of messages (push events, the initial bulk load, fallback
//! polls, send acknowledgments) funnels through the same merge routine, so the
//! result never depends on which source won a race:
//!
//! - entries are keyed by id; re-applying a batch is a no-op
//! - an existing entry only changes when the incoming status is forward
//!   progress (see [`MessageStatus::can_advance_to`])
//! - unseen ids are inserted at their timestamp position with a binary
//!   search; equal timestamps keep insertion order
//! - a server message that matches an outstanding optimistic placeholder
//!   takes over the placeholder's slot instead of being appended
//! - malformed entries are dropped one by one, the rest of the batch applies
//!
//! An entry's timestamp never changes after insertion. A reconciled
//! placeholder keeps the local timestamp it was displayed with.

use std::collections::HashMap;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use ticketsync_shared::{
    IncomingMessage, Message, MessageId, MessageStatus, ProvidedFields, TicketId,
};

use crate::bus::{EngineEvent, EventBus};
use crate::error::{EngineError, EngineResult};

/// Default window for matching a server message to a placeholder
pub const DEFAULT_RECONCILIATION_WINDOW: Duration = Duration::from_secs(30);

type SortKey = (OffsetDateTime, u64);

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
}

impl Entry {
    fn key(&self) -> SortKey {
        (self.message.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct Timeline {
    /// Sorted by (timestamp, seq)
    entries: Vec<Entry>,
    keys: HashMap<MessageId, SortKey>,
    /// Outstanding placeholders, oldest first
    placeholders: Vec<MessageId>,
    /// Reconciled placeholder id -> server id
    aliases: HashMap<MessageId, MessageId>,
    next_seq: u64,
    loaded: bool,
}

impl Timeline {
    fn position(&self, id: &MessageId) -> Option<usize> {
        let key = self.keys.get(id)?;
        self.entries.binary_search_by(|e| e.key().cmp(key)).ok()
    }

    /// Position of `id`, following a reconciled placeholder to its server id
    fn resolve(&self, id: &MessageId) -> Option<usize> {
        self.position(id).or_else(|| {
            self.aliases
                .get(id)
                .and_then(|server_id| self.position(server_id))
        })
    }

    fn is_placeholder(&self, id: &MessageId) -> bool {
        self.placeholders.contains(id)
    }

    fn insert(&mut self, message: Message) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        let timestamp = message.timestamp;
        let pos = self.entries.partition_point(|e| e.message.timestamp <= timestamp);

        self.keys.insert(message.id.clone(), (timestamp, seq));
        self.entries.insert(pos, Entry { message, seq });
        pos
    }

    /// Oldest outstanding placeholder that `incoming` plausibly confirms
    fn find_placeholder(&self, incoming: &Message, window: Duration) -> Option<usize> {
        self.placeholders.iter().find_map(|id| {
            let pos = self.position(id)?;
            let candidate = &self.entries[pos].message;

            let outstanding = matches!(
                candidate.status,
                MessageStatus::Sending | MessageStatus::Failed
            );
            let close_enough = (candidate.timestamp - incoming.timestamp).unsigned_abs() <= window;

            (outstanding && close_enough && candidate.same_payload(incoming)).then_some(pos)
        })
    }

    /// Swap the placeholder at `pos` for its server copy, keeping the slot
    fn reconcile_at(&mut self, pos: usize, incoming: Message) {
        let entry = &mut self.entries[pos];
        let local_id = std::mem::replace(&mut entry.message.id, incoming.id.clone());
        let key = entry.key();

        if entry.message.status.can_advance_to(incoming.status) {
            entry.message.status = incoming.status;
        }
        entry.message.content = incoming.content;
        entry.message.sender_name = incoming.sender_name;
        entry.message.media = incoming.media;
        entry.message.is_internal = incoming.is_internal;

        self.keys.remove(&local_id);
        self.keys.insert(incoming.id.clone(), key);
        self.placeholders.retain(|id| *id != local_id);
        self.aliases.insert(local_id, incoming.id);
    }

    fn insert_placeholder(&mut self, message: Message) -> usize {
        self.placeholders.push(message.id.clone());
        self.insert(message)
    }

    /// Apply `incoming` to the existing entry at `pos` if it moves it forward.
    /// Only the fields the wire entry carried replace stored ones.
    fn update_at(&mut self, pos: usize, incoming: Message, provided: ProvidedFields) -> bool {
        let current = &mut self.entries[pos].message;

        if !current.status.can_advance_to(incoming.status) {
            return false;
        }

        current.status = incoming.status;
        if provided.content {
            current.content = incoming.content;
        }
        if provided.sender_name {
            current.sender_name = incoming.sender_name;
        }
        if provided.media {
            current.media = incoming.media;
        }
        if provided.is_internal {
            current.is_internal = incoming.is_internal;
        }

        if current.status.is_confirmed() {
            let id = current.id.clone();
            self.placeholders.retain(|p| *p != id);
        }
        true
    }

    /// Drop a placeholder whose server copy already has its own row
    fn absorb_placeholder(&mut self, local_id: &MessageId, server_id: &MessageId) {
        let Some(pos) = self.position(local_id) else {
            return;
        };

        self.entries.remove(pos);
        self.keys.remove(local_id);
        self.placeholders.retain(|id| id != local_id);
        self.aliases.insert(local_id.clone(), server_id.clone());
    }

    fn merge(
        &mut self,
        ticket_id: &TicketId,
        batch: Vec<IncomingMessage>,
        window: Duration,
    ) -> (MergeReport, Vec<Message>) {
        let mut report = MergeReport::default();
        let mut fresh = Vec::new();

        for raw in batch {
            let provided = raw.provided();
            let incoming = match raw.validate(ticket_id) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        ticket_id = %ticket_id,
                        error = %e,
                        "Dropping malformed message entry"
                    );
                    report.rejected += 1;
                    continue;
                }
            };

            if let Some(pos) = self.position(&incoming.id) {
                if self.update_at(pos, incoming, provided) {
                    report.updated += 1;
                } else {
                    report.unchanged += 1;
                }
            } else if let Some(pos) = self
                .find_placeholder(&incoming, window)
                .filter(|_| provided.content)
            {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    server_id = %incoming.id,
                    position = pos,
                    "Reconciled placeholder with server message"
                );
                self.reconcile_at(pos, incoming);
                report.reconciled += 1;
            } else {
                fresh.push(incoming.clone());
                self.insert(incoming);
                report.inserted += 1;
            }
        }

        (report, fresh)
    }

    fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }
}

/// What a merge did to a timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub reconciled: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.reconciled > 0
    }
}

/// Result of [`MessageStore::update_status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied(Message),
    /// Not forward progress; carries the status that was kept
    Unchanged(MessageStatus),
    NotFound,
}

/// Outcome of failing a placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderFailure {
    /// Placeholder is now `failed`
    Failed(Message),
    /// A server message already took over the placeholder
    AlreadyConfirmed(Message),
    /// Ticket was torn down
    Missing,
}

#[derive(Debug, Default)]
struct StoreState {
    timelines: HashMap<TicketId, Timeline>,
    /// Survives teardown so late bulk-load responses can be recognised
    epochs: HashMap<TicketId, u64>,
}

/// Store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tickets: usize,
    pub messages: usize,
    pub pending_placeholders: usize,
}

/// Single writer for all ticket timelines
pub struct MessageStore {
    state: RwLock<StoreState>,
    bus: EventBus,
    reconciliation_window: Duration,
}

impl MessageStore {
    pub fn new(bus: EventBus, reconciliation_window: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            bus,
            reconciliation_window,
        }
    }

    /// Snapshot of a ticket's timeline in display order
    pub async fn get_timeline(&self, ticket_id: &TicketId) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .timelines
            .get(ticket_id)
            .map(Timeline::messages)
            .unwrap_or_default()
    }

    pub async fn get_message(&self, ticket_id: &TicketId, id: &MessageId) -> Option<Message> {
        let state = self.state.read().await;
        let timeline = state.timelines.get(ticket_id)?;
        timeline.resolve(id).map(|pos| timeline.entries[pos].message.clone())
    }

    /// Whether the first bulk load for the ticket has been applied
    pub async fn is_loaded(&self, ticket_id: &TicketId) -> bool {
        let state = self.state.read().await;
        state.timelines.get(ticket_id).is_some_and(|t| t.loaded)
    }

    /// Merge pushed messages (`message:new`, `message:update`)
    pub async fn merge_incoming(
        &self,
        ticket_id: &TicketId,
        batch: Vec<IncomingMessage>,
    ) -> MergeReport {
        let (report, fresh) = {
            let mut state = self.state.write().await;
            let timeline = state.timelines.entry(ticket_id.clone()).or_default();
            timeline.merge(ticket_id, batch, self.reconciliation_window)
        };

        self.publish_merge(ticket_id, &report, fresh, true);
        report
    }

    /// Merge a full-timeline load.
    ///
    /// Messages inserted by the first load of a ticket are history and do not
    /// raise `MessageReceived`; later loads (polls) do.
    pub async fn apply_bulk_load(
        &self,
        ticket_id: &TicketId,
        batch: Vec<IncomingMessage>,
    ) -> MergeReport {
        self.apply_bulk(ticket_id, None, batch)
            .await
            .unwrap_or_default()
    }

    /// Current load epoch; capture it before issuing a bulk load
    pub async fn load_epoch(&self, ticket_id: &TicketId) -> u64 {
        let state = self.state.read().await;
        state.epochs.get(ticket_id).copied().unwrap_or(0)
    }

    /// Apply a bulk load issued at `epoch`, or discard it if the ticket was
    /// torn down in the meantime
    pub async fn apply_bulk_load_at(
        &self,
        ticket_id: &TicketId,
        epoch: u64,
        batch: Vec<IncomingMessage>,
    ) -> Option<MergeReport> {
        self.apply_bulk(ticket_id, Some(epoch), batch).await
    }

    async fn apply_bulk(
        &self,
        ticket_id: &TicketId,
        epoch: Option<u64>,
        batch: Vec<IncomingMessage>,
    ) -> Option<MergeReport> {
        let (report, fresh, notify) = {
            let mut state = self.state.write().await;

            let current = state.epochs.get(ticket_id).copied().unwrap_or(0);
            if epoch.is_some_and(|epoch| epoch != current) {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    epoch = ?epoch,
                    current,
                    "Discarding stale bulk load"
                );
                return None;
            }

            let timeline = state.timelines.entry(ticket_id.clone()).or_default();
            let notify = timeline.loaded;
            let (report, fresh) = timeline.merge(ticket_id, batch, self.reconciliation_window);
            timeline.loaded = true;
            (report, fresh, notify)
        };

        tracing::debug!(
            ticket_id = %ticket_id,
            inserted = report.inserted,
            updated = report.updated,
            reconciled = report.reconciled,
            rejected = report.rejected,
            "Applied bulk load"
        );

        self.publish_merge(ticket_id, &report, fresh, notify);
        Some(report)
    }

    /// Insert an optimistic placeholder
    pub async fn insert_placeholder(&self, placeholder: Message) {
        let ticket_id = placeholder.ticket_id.clone();
        {
            let mut state = self.state.write().await;
            let timeline = state.timelines.entry(ticket_id.clone()).or_default();
            let pos = timeline.insert_placeholder(placeholder);
            tracing::debug!(ticket_id = %ticket_id, position = pos, "Inserted placeholder");
        }
        self.bus.publish(EngineEvent::TimelineUpdated { ticket_id });
    }

    /// Settle a placeholder with the server copy from its send acknowledgment.
    ///
    /// A ticket torn down while the send was in flight stays torn down: the
    /// server copy is handed back to the caller without touching the store.
    pub async fn confirm_placeholder(
        &self,
        ticket_id: &TicketId,
        local_id: &MessageId,
        server: Message,
    ) -> Message {
        let (confirmed, fresh) = {
            let mut state = self.state.write().await;
            let Some(timeline) = state.timelines.get_mut(ticket_id) else {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    local_id = %local_id,
                    server_id = %server.id,
                    "Send confirmed after ticket teardown"
                );
                return server;
            };

            if let Some(pos) = timeline.position(&server.id) {
                // A push or poll got here first
                let server_id = server.id.clone();
                timeline.update_at(pos, server.clone(), ProvidedFields::ALL);
                timeline.absorb_placeholder(local_id, &server_id);

                let current = timeline
                    .position(&server_id)
                    .map(|pos| timeline.entries[pos].message.clone())
                    .unwrap_or(server);
                (current, None)
            } else if let Some(pos) = timeline.position(local_id) {
                timeline.reconcile_at(pos, server);
                (timeline.entries[pos].message.clone(), None)
            } else if let Some(pos) =
                timeline.find_placeholder(&server, self.reconciliation_window)
            {
                timeline.reconcile_at(pos, server);
                (timeline.entries[pos].message.clone(), None)
            } else {
                let pos = timeline.insert(server);
                let message = timeline.entries[pos].message.clone();
                (message.clone(), Some(message))
            }
        };

        tracing::debug!(
            ticket_id = %ticket_id,
            local_id = %local_id,
            server_id = %confirmed.id,
            "Send confirmed"
        );

        if let Some(message) = fresh {
            self.bus.publish(EngineEvent::MessageReceived {
                ticket_id: ticket_id.clone(),
                message,
            });
        }
        self.bus.publish(EngineEvent::TimelineUpdated {
            ticket_id: ticket_id.clone(),
        });
        confirmed
    }

    /// Flip a placeholder to `failed` unless a server message already took it over
    pub async fn fail_placeholder(
        &self,
        ticket_id: &TicketId,
        local_id: &MessageId,
    ) -> PlaceholderFailure {
        let outcome = {
            let mut state = self.state.write().await;
            let Some(timeline) = state.timelines.get_mut(ticket_id) else {
                return PlaceholderFailure::Missing;
            };

            if let Some(pos) = timeline.position(local_id) {
                let entry = &mut timeline.entries[pos].message;
                if entry.status.can_advance_to(MessageStatus::Failed) {
                    entry.status = MessageStatus::Failed;
                }
                PlaceholderFailure::Failed(entry.clone())
            } else if let Some(pos) = timeline.resolve(local_id) {
                PlaceholderFailure::AlreadyConfirmed(timeline.entries[pos].message.clone())
            } else {
                PlaceholderFailure::Missing
            }
        };

        if matches!(outcome, PlaceholderFailure::Failed(_)) {
            self.bus.publish(EngineEvent::TimelineUpdated {
                ticket_id: ticket_id.clone(),
            });
        }
        outcome
    }

    /// Move a failed placeholder back to `sending` for an explicit re-send
    pub async fn reset_for_retry(
        &self,
        ticket_id: &TicketId,
        id: &MessageId,
    ) -> EngineResult<Message> {
        let message = {
            let mut state = self.state.write().await;
            let timeline = state
                .timelines
                .get_mut(ticket_id)
                .ok_or_else(|| EngineError::UnknownMessage {
                    ticket_id: ticket_id.clone(),
                    message_id: id.clone(),
                })?;

            let pos = timeline
                .position(id)
                .ok_or_else(|| EngineError::UnknownMessage {
                    ticket_id: ticket_id.clone(),
                    message_id: id.clone(),
                })?;

            let retryable = timeline.is_placeholder(id)
                && timeline.entries[pos].message.status == MessageStatus::Failed;
            if !retryable {
                return Err(EngineError::NotRetryable {
                    message_id: id.clone(),
                });
            }

            let entry = &mut timeline.entries[pos].message;
            entry.status = MessageStatus::Sending;
            entry.clone()
        };

        self.bus.publish(EngineEvent::TimelineUpdated {
            ticket_id: ticket_id.clone(),
        });
        Ok(message)
    }

    /// Explicit status change (read receipts, delivery reports)
    pub async fn update_status(
        &self,
        ticket_id: &TicketId,
        id: &MessageId,
        status: MessageStatus,
    ) -> StatusUpdate {
        let outcome = {
            let mut state = self.state.write().await;
            let Some(timeline) = state.timelines.get_mut(ticket_id) else {
                return StatusUpdate::NotFound;
            };
            let Some(pos) = timeline.resolve(id) else {
                return StatusUpdate::NotFound;
            };

            let entry = &mut timeline.entries[pos].message;
            if entry.status.can_advance_to(status) {
                entry.status = status;
                StatusUpdate::Applied(entry.clone())
            } else {
                StatusUpdate::Unchanged(entry.status)
            }
        };

        if matches!(outcome, StatusUpdate::Applied(_)) {
            self.bus.publish(EngineEvent::TimelineUpdated {
                ticket_id: ticket_id.clone(),
            });
        }
        outcome
    }

    /// Drop a ticket's timeline and invalidate in-flight bulk loads
    pub async fn teardown(&self, ticket_id: &TicketId) {
        let mut state = self.state.write().await;
        *state.epochs.entry(ticket_id.clone()).or_insert(0) += 1;

        if let Some(timeline) = state.timelines.remove(ticket_id) {
            tracing::debug!(
                ticket_id = %ticket_id,
                messages = timeline.entries.len(),
                pending = timeline.placeholders.len(),
                "Tore down ticket timeline"
            );
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            tickets: state.timelines.len(),
            messages: state.timelines.values().map(|t| t.entries.len()).sum(),
            pending_placeholders: state.timelines.values().map(|t| t.placeholders.len()).sum(),
        }
    }

    fn publish_merge(
        &self,
        ticket_id: &TicketId,
        report: &MergeReport,
        fresh: Vec<Message>,
        notify: bool,
    ) {
        if notify {
            for message in fresh {
                self.bus.publish(EngineEvent::MessageReceived {
                    ticket_id: ticket_id.clone(),
                    message,
                });
            }
        }

        if report.changed() {
            self.bus.publish(EngineEvent::TimelineUpdated {
                ticket_id: ticket_id.clone(),
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use crate::testing::incoming;
    use ticketsync_shared::Sender;
    use tokio::sync::broadcast::error::TryRecvError;

    fn store() -> MessageStore {
        MessageStore::new(EventBus::new(64), DEFAULT_RECONCILIATION_WINDOW)
    }

    fn t1() -> TicketId {
        TicketId::new("T1")
    }

    fn ids(timeline: &[Message]) -> Vec<&str> {
        timeline.iter().map(|m| m.id.as_str()).collect()
    }

    fn agent_placeholder(content: &str, offset_secs: i64) -> Message {
        let mut p = Message::placeholder(t1(), content, "Ana", false);
        p.timestamp =
            time::macros::datetime!(2025-03-01 10:00:00 UTC) + time::Duration::seconds(offset_secs);
        p
    }

    fn agent_echo(id: &str, content: &str, offset_secs: i64) -> IncomingMessage {
        let mut m = incoming(id, content, offset_secs, MessageStatus::Sent);
        m.sender = Some(Sender::Agent);
        m.sender_name = Some("Ana".to_string());
        m
    }

    #[tokio::test]
    async fn test_forward_progress_applied_and_regression_ignored() {
        let store = store();
        store
            .merge_incoming(&t1(), vec![incoming("1", "hello", 0, MessageStatus::Sent)])
            .await;

        store
            .apply_bulk_load(&t1(), vec![incoming("1", "hello", 0, MessageStatus::Delivered)])
            .await;
        assert_eq!(store.get_timeline(&t1()).await[0].status, MessageStatus::Delivered);

        let report = store
            .apply_bulk_load(&t1(), vec![incoming("1", "hello", 0, MessageStatus::Sent)])
            .await;
        let timeline = store.get_timeline(&t1()).await;
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].status, MessageStatus::Delivered);
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn test_same_batch_twice_is_idempotent() {
        let store = store();
        let batch = vec![
            incoming("a", "one", 5, MessageStatus::Sent),
            incoming("b", "two", 1, MessageStatus::Read),
            incoming("c", "three", 3, MessageStatus::Delivered),
        ];

        store.merge_incoming(&t1(), batch.clone()).await;
        let once = store.get_timeline(&t1()).await;

        let report = store.merge_incoming(&t1(), batch).await;
        let twice = store.get_timeline(&t1()).await;

        assert_eq!(once, twice);
        assert!(!report.changed());
        assert_eq!(ids(&twice), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_insertion_order() {
        let store = store();
        store
            .merge_incoming(&t1(), vec![incoming("x", "first", 0, MessageStatus::Sent)])
            .await;
        store
            .merge_incoming(
                &t1(),
                vec![
                    incoming("y", "second", 0, MessageStatus::Sent),
                    incoming("w", "earlier", -10, MessageStatus::Sent),
                ],
            )
            .await;

        assert_eq!(ids(&store.get_timeline(&t1()).await), vec!["w", "x", "y"]);
    }

    #[tokio::test]
    async fn test_malformed_entries_rejected_individually() {
        let store = store();
        let mut no_id = incoming("ignored", "no id", 1, MessageStatus::Sent);
        no_id.id = None;
        let mut no_ts = incoming("z", "no timestamp", 2, MessageStatus::Sent);
        no_ts.timestamp = None;

        let report = store
            .merge_incoming(
                &t1(),
                vec![no_id, incoming("ok", "valid", 3, MessageStatus::Sent), no_ts],
            )
            .await;

        assert_eq!(report.rejected, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(ids(&store.get_timeline(&t1()).await), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_placeholder_reconciled_in_place() {
        let store = store();
        store
            .merge_incoming(&t1(), vec![incoming("c1", "before", -5, MessageStatus::Sent)])
            .await;
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;
        store
            .merge_incoming(&t1(), vec![incoming("c2", "after", 2, MessageStatus::Sent)])
            .await;

        // Server copy is stamped a little later than the local clock
        let report = store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 4)]).await;

        let timeline = store.get_timeline(&t1()).await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(ids(&timeline), vec!["c1", "s1", "c2"]);
        assert_eq!(timeline[1].status, MessageStatus::Sent);
        assert!(store.get_message(&t1(), &local_id).await.is_some());
        assert_eq!(store.stats().await.pending_placeholders, 0);
    }

    #[tokio::test]
    async fn test_identical_placeholders_reconcile_oldest_first() {
        let store = store();
        let first = agent_placeholder("ok", 0);
        let second = agent_placeholder("ok", 1);
        store.insert_placeholder(first).await;
        store.insert_placeholder(second.clone()).await;

        store.merge_incoming(&t1(), vec![agent_echo("s1", "ok", 1)]).await;

        let timeline = store.get_timeline(&t1()).await;
        assert_eq!(timeline[0].id.as_str(), "s1");
        assert_eq!(timeline[1].id, second.id);
        assert_eq!(timeline[1].status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn test_placeholder_outside_window_not_reconciled() {
        let store = store();
        store.insert_placeholder(agent_placeholder("hi", 0)).await;

        store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 120)]).await;

        assert_eq!(store.get_timeline(&t1()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_client_message_never_matches_agent_placeholder() {
        let store = store();
        store.insert_placeholder(agent_placeholder("hi", 0)).await;

        let report = store
            .merge_incoming(&t1(), vec![incoming("c1", "hi", 1, MessageStatus::Sent)])
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(store.get_timeline(&t1()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_after_push_does_not_duplicate() {
        let store = store();
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;

        store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 1)]).await;
        let server = agent_echo("s1", "hi", 1).validate(&t1()).unwrap();
        let confirmed = store.confirm_placeholder(&t1(), &local_id, server).await;

        assert_eq!(confirmed.id.as_str(), "s1");
        assert_eq!(store.get_timeline(&t1()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_absorbs_unmatched_placeholder() {
        let store = store();
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;

        // Server clock far off: the push could not be matched heuristically
        store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 90)]).await;
        assert_eq!(store.get_timeline(&t1()).await.len(), 2);

        let server = agent_echo("s1", "hi", 90).validate(&t1()).unwrap();
        store.confirm_placeholder(&t1(), &local_id, server).await;

        let timeline = store.get_timeline(&t1()).await;
        assert_eq!(ids(&timeline), vec!["s1"]);
        assert_eq!(store.stats().await.pending_placeholders, 0);
        assert!(matches!(
            store.fail_placeholder(&t1(), &local_id).await,
            PlaceholderFailure::AlreadyConfirmed(_)
        ));
    }

    #[tokio::test]
    async fn test_fail_placeholder_after_reconciliation() {
        let store = store();
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;
        store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 1)]).await;

        match store.fail_placeholder(&t1(), &local_id).await {
            PlaceholderFailure::AlreadyConfirmed(message) => {
                assert_eq!(message.status, MessageStatus::Sent)
            }
            other => panic!("Expected AlreadyConfirmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_only_for_failed_placeholders() {
        let store = store();
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;

        assert!(matches!(
            store.reset_for_retry(&t1(), &local_id).await,
            Err(EngineError::NotRetryable { .. })
        ));

        store.fail_placeholder(&t1(), &local_id).await;
        let reset = store.reset_for_retry(&t1(), &local_id).await.unwrap();
        assert_eq!(reset.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn test_update_status_respects_progression() {
        let store = store();
        store
            .merge_incoming(&t1(), vec![incoming("1", "x", 0, MessageStatus::Read)])
            .await;

        let outcome = store
            .update_status(&t1(), &MessageId::new("1"), MessageStatus::Delivered)
            .await;
        assert_eq!(outcome, StatusUpdate::Unchanged(MessageStatus::Read));

        let missing = store
            .update_status(&t1(), &MessageId::new("nope"), MessageStatus::Read)
            .await;
        assert_eq!(missing, StatusUpdate::NotFound);
    }

    #[tokio::test]
    async fn test_first_bulk_load_is_not_notified() {
        let bus = EventBus::new(64);
        let store = MessageStore::new(bus.clone(), DEFAULT_RECONCILIATION_WINDOW);
        let mut rx = bus.subscribe();

        store
            .apply_bulk_load(&t1(), vec![incoming("1", "old", 0, MessageStatus::Read)])
            .await;
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::TimelineUpdated { .. })));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        store
            .apply_bulk_load(
                &t1(),
                vec![
                    incoming("1", "old", 0, MessageStatus::Read),
                    incoming("2", "new", 9, MessageStatus::Sent),
                ],
            )
            .await;
        match rx.try_recv() {
            Ok(EngineEvent::MessageReceived { message, .. }) => {
                assert_eq!(message.id.as_str(), "2")
            }
            other => panic!("Expected MessageReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconciled_message_is_not_notified() {
        let bus = EventBus::new(64);
        let store = MessageStore::new(bus.clone(), DEFAULT_RECONCILIATION_WINDOW);
        store.insert_placeholder(agent_placeholder("hi", 0)).await;
        let mut rx = bus.subscribe();

        store.merge_incoming(&t1(), vec![agent_echo("s1", "hi", 1)]).await;

        assert!(matches!(rx.try_recv(), Ok(EngineEvent::TimelineUpdated { .. })));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_teardown_discards_in_flight_load() {
        let store = store();
        let epoch = store.load_epoch(&t1()).await;

        store.teardown(&t1()).await;
        let applied = store
            .apply_bulk_load_at(&t1(), epoch, vec![incoming("1", "late", 0, MessageStatus::Sent)])
            .await;

        assert!(applied.is_none());
        assert!(store.get_timeline(&t1()).await.is_empty());
    }

    #[tokio::test]
    async fn test_status_only_update_keeps_payload() {
        let store = store();
        store
            .merge_incoming(&t1(), vec![incoming("1", "hello", 0, MessageStatus::Sent)])
            .await;

        let partial = IncomingMessage {
            id: Some(MessageId::new("1")),
            timestamp: incoming("1", "", 0, MessageStatus::Sent).timestamp,
            status: Some(MessageStatus::Delivered),
            ..Default::default()
        };
        let report = store.merge_incoming(&t1(), vec![partial]).await;

        let timeline = store.get_timeline(&t1()).await;
        assert_eq!(report.updated, 1);
        assert_eq!(timeline[0].status, MessageStatus::Delivered);
        assert_eq!(timeline[0].content, "hello");
        assert_eq!(timeline[0].sender_name, "Maria");
        assert_eq!(timeline[0].media, ticketsync_shared::MessageMedia::Text);
    }

    #[tokio::test]
    async fn test_status_only_update_never_reconciles_placeholder() {
        let store = store();
        store.insert_placeholder(agent_placeholder("", 0)).await;

        let mut partial = agent_echo("s1", "", 1);
        partial.content = None;
        let report = store.merge_incoming(&t1(), vec![partial]).await;

        assert_eq!(report.reconciled, 0);
        assert_eq!(store.stats().await.pending_placeholders, 1);
    }

    #[tokio::test]
    async fn test_confirm_after_teardown_leaves_store_empty() {
        let bus = EventBus::new(64);
        let store = MessageStore::new(bus.clone(), DEFAULT_RECONCILIATION_WINDOW);
        let placeholder = agent_placeholder("hi", 0);
        let local_id = placeholder.id.clone();
        store.insert_placeholder(placeholder).await;
        store.teardown(&t1()).await;
        let mut rx = bus.subscribe();

        let server = agent_echo("s1", "hi", 1).validate(&t1()).unwrap();
        let confirmed = store.confirm_placeholder(&t1(), &local_id, server).await;

        assert_eq!(confirmed.id.as_str(), "s1");
        assert_eq!(store.stats().await.tickets, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_server_id_with_local_prefix_is_not_a_placeholder() {
        let store = store();
        let mut odd = incoming("local-42", "from the server", 0, MessageStatus::Sent);
        odd.status = Some(MessageStatus::Failed);
        store.merge_incoming(&t1(), vec![odd]).await;

        assert_eq!(store.stats().await.pending_placeholders, 0);
        assert!(matches!(
            store.reset_for_retry(&t1(), &MessageId::new("local-42")).await,
            Err(EngineError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn test_interleaved_batches_stay_sorted_and_unique() {
        let store = store();
        let statuses = [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ];

        // Deterministic pseudo-random interleaving of overlapping batches
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for round in 0..40 {
            let mut batch = Vec::new();
            for _ in 0..6 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let n = (seed % 25) as i64;
                let status = statuses[(seed >> 8) as usize % statuses.len()];
                batch.push(incoming(&format!("m{n}"), "body", n % 7, status));
            }
            if round % 2 == 0 {
                store.merge_incoming(&t1(), batch).await;
            } else {
                store.apply_bulk_load(&t1(), batch).await;
            }
        }

        let timeline = store.get_timeline(&t1()).await;
        let mut seen = std::collections::HashSet::new();
        assert!(timeline.iter().all(|m| seen.insert(m.id.clone())));
        assert!(timeline.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
