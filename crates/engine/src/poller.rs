//! Polling fallback
//!
//! While a ticket is active its full timeline is re-requested on a fixed
//! interval and merged like any other batch, whatever state the push channel
//! is in. If push delivery silently loses something, the next poll converges
//! the timeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use ticketsync_shared::TicketId;

use crate::bus::{EngineEvent, EventBus};
use crate::channel::transport::MessageLoader;
use crate::error::LoadError;
use crate::store::{MergeReport, MessageStore};

pub struct PollingFallbackScheduler {
    store: Arc<MessageStore>,
    loader: Arc<dyn MessageLoader>,
    bus: EventBus,
    interval: Duration,
    tasks: Mutex<HashMap<TicketId, JoinHandle<()>>>,
}

impl PollingFallbackScheduler {
    pub fn new(
        store: Arc<MessageStore>,
        loader: Arc<dyn MessageLoader>,
        bus: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            loader,
            bus,
            interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling a ticket. No-op if it is already polled.
    pub fn start(self: &Arc<Self>, ticket_id: TicketId) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if tasks.contains_key(&ticket_id) {
            return;
        }

        tracing::info!(ticket_id = %ticket_id, interval = ?self.interval, "Polling started");

        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(self),
            ticket_id.clone(),
            self.interval,
        ));
        tasks.insert(ticket_id, handle);
    }

    /// Stop polling a ticket; a poll in flight is abandoned
    pub fn stop(&self, ticket_id: &TicketId) {
        let handle = self.tasks.lock().ok().and_then(|mut tasks| tasks.remove(ticket_id));

        if let Some(handle) = handle {
            handle.abort();
            tracing::info!(ticket_id = %ticket_id, "Polling stopped");
        }
    }

    pub fn stop_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    pub fn is_running(&self, ticket_id: &TicketId) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(ticket_id))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Fetch and merge a ticket's full timeline once.
    ///
    /// Returns `Ok(None)` when the ticket was torn down while the request was
    /// in flight and the response was discarded. Failures are published as
    /// [`EngineEvent::LoadFailed`]; the timeline keeps its last good state.
    pub async fn load_now(&self, ticket_id: &TicketId) -> Result<Option<MergeReport>, LoadError> {
        let epoch = self.store.load_epoch(ticket_id).await;

        match self.loader.load_messages(ticket_id).await {
            Ok(batch) => Ok(self.store.apply_bulk_load_at(ticket_id, epoch, batch).await),
            Err(e) => {
                tracing::warn!(ticket_id = %ticket_id, error = %e, "Bulk load failed");
                self.bus.publish(EngineEvent::LoadFailed {
                    ticket_id: ticket_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl Drop for PollingFallbackScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn poll_loop(
    scheduler: Weak<PollingFallbackScheduler>,
    ticket_id: TicketId,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick; the initial load is issued separately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };

        // Errors are already logged and published; the next tick retries
        if let Ok(Some(report)) = scheduler.load_now(&ticket_id).await {
            if report.changed() {
                tracing::debug!(
                    ticket_id = %ticket_id,
                    inserted = report.inserted,
                    updated = report.updated,
                    "Poll converged timeline"
                );
            }
        }
    }
}
