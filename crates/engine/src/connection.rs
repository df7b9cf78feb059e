//! Push channel connection lifecycle
//!
//! Owns the connection state machine and the reconnection policy. After an
//! unexpected drop the manager retries with exponential backoff and jitter,
//! capped at a maximum delay, and gives up into `error` after a bounded number
//! of attempts. From `error` only an explicit `connect()` starts over; polling
//! keeps timelines converging in the meantime.
//!
//! ```text
//! disconnected --connect()--> connecting --ack--> connected
//! connecting --failure--> error --connect()--> connecting
//! connected --drop--> reconnecting --ack--> connected
//! reconnecting --max attempts exceeded--> error
//! any --disconnect()--> disconnected
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use ticketsync_shared::IncomingMessage;

use crate::bus::{EngineEvent, EventBus};
use crate::channel::events::{ChannelCommand, SendMessagePayload};
use crate::channel::transport::ChannelTransport;
use crate::error::TransportError;

/// State of the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, last_error: String },
    Error { attempt: u32, last_error: String },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Error { .. } => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected | Error { .. }, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Error { .. }) => true,
            (Connected, Reconnecting { .. }) => true,
            (Reconnecting { attempt: from, .. }, Reconnecting { attempt: to, .. }) => to >= from,
            (Reconnecting { .. }, Connected) => true,
            (Reconnecting { .. }, Error { .. }) => true,
            _ => false,
        }
    }
}

/// Connection state plus a counter bumped on every entry into `connected`.
///
/// Room subscriptions are scoped to one session; a consumer that sees the
/// session change knows the channel was re-established underneath it even if
/// it never observed the intermediate states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub session: u64,
}

/// Reconnection backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt (before jitter)
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Attempts before giving up into `error`
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8, // roughly two minutes of trying before surfacing
        }
    }
}

impl ReconnectPolicy {
    /// Delay before each attempt: base, 2x base, 4x base ... capped at
    /// `max_delay`, each scaled by full jitter
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);

        ExponentialBackoff::from_millis(2)
            .factor((base_ms / 2).max(1))
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts as usize)
    }
}

/// Owns the push channel's lifecycle
pub struct ConnectionManager {
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
    bus: EventBus,
    status: watch::Sender<ConnectionStatus>,
    /// Bumped by connect()/disconnect() so superseded attempts stand down
    epoch: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        policy: ReconnectPolicy,
        bus: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            session: 0,
        });

        Self {
            transport,
            policy,
            bus,
            status,
            epoch: AtomicU64::new(0),
            reconnect_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    /// Subscribe to state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Open the channel.
    ///
    /// No-op unless the channel is `disconnected` or in `error`. A failed
    /// first attempt lands in `error` with attempt 1; it is not retried
    /// automatically.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if !self.transition(ConnectionState::Connecting) {
            tracing::debug!(state = self.state().as_str(), "connect() ignored");
            return Ok(());
        }

        self.cancel_reconnect();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        match self.transport.open().await {
            Ok(()) => {
                if self.is_current(epoch) {
                    self.transition(ConnectionState::Connected);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Channel connect failed");
                if self.is_current(epoch) {
                    self.transition(ConnectionState::Error {
                        attempt: 1,
                        last_error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Close the channel from any state
    pub async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_reconnect();
        self.transition(ConnectionState::Disconnected);
        self.transport.close().await;
    }

    /// `connection:open` received from the channel
    pub fn handle_open(&self) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                self.cancel_reconnect();
                self.transition(ConnectionState::Connected);
            }
            other => {
                tracing::debug!(state = other.as_str(), "Ignoring connection:open");
            }
        }
    }

    /// `connection:close` or `connection:error` received from the channel.
    ///
    /// While a reconnect loop is already running the drop only refreshes the
    /// reported error; the attempt count and the loop are left alone.
    pub fn handle_drop(self: &Arc<Self>, reason: impl Into<String>) {
        let reason = reason.into();

        if self.refresh_reconnect_error(&reason) {
            return;
        }

        if !self.transition(ConnectionState::Reconnecting {
            attempt: 1,
            last_error: reason.clone(),
        }) {
            tracing::debug!(
                state = self.state().as_str(),
                reason = %reason,
                "Ignoring channel drop outside connected state"
            );
            return;
        }

        tracing::warn!(reason = %reason, "Channel dropped - reconnecting");

        let epoch = self.epoch.load(Ordering::SeqCst);
        let handle = tokio::spawn(Arc::clone(self).reconnect_loop(epoch, reason));

        if let Ok(mut slot) = self.reconnect_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Emit a command; fails fast unless connected
    pub async fn emit(&self, command: ChannelCommand) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.emit(command).await
    }

    /// Submit a message and wait for its acknowledgment; fails fast unless connected
    pub async fn send_message(
        &self,
        payload: SendMessagePayload,
    ) -> Result<IncomingMessage, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.send_message(payload).await
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64, mut last_error: String) {
        let mut attempt = 0;

        for delay in self.policy.delays() {
            attempt += 1;

            if !self.is_current(epoch) {
                return;
            }
            // handle_drop already entered attempt 1
            if attempt > 1 {
                self.transition(ConnectionState::Reconnecting {
                    attempt,
                    last_error: last_error.clone(),
                });
            }

            tracing::debug!(attempt, delay = ?delay, "Waiting before reconnect attempt");
            tokio::time::sleep(delay).await;

            // connection:open may have arrived while we slept
            let still_reconnecting = matches!(self.state(), ConnectionState::Reconnecting { .. });
            if !self.is_current(epoch) || !still_reconnecting {
                return;
            }

            match self.transport.open().await {
                Ok(()) => {
                    if self.is_current(epoch) {
                        self.transition(ConnectionState::Connected);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        if self.is_current(epoch) {
            tracing::error!(
                attempts = attempt,
                last_error = %last_error,
                "Reconnection attempts exhausted"
            );
            self.transition(ConnectionState::Error {
                attempt,
                last_error,
            });
        }
    }

    fn refresh_reconnect_error(&self, reason: &str) -> bool {
        let mut refreshed = None;

        self.status.send_if_modified(|status| match &mut status.state {
            ConnectionState::Reconnecting { attempt, last_error } => {
                refreshed = Some(*attempt);
                if last_error == reason {
                    return false;
                }
                *last_error = reason.to_string();
                true
            }
            _ => false,
        });

        let Some(attempt) = refreshed else {
            return false;
        };

        tracing::debug!(attempt, reason = %reason, "Channel drop during reconnect");
        self.bus.publish(EngineEvent::ConnectionChanged(self.state()));
        true
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn cancel_reconnect(&self) {
        if let Ok(mut slot) = self.reconnect_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Apply `next` if the state machine allows it. Returns false for
    /// disallowed edges and for no-op transitions.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;

        self.status.send_if_modified(|status| {
            if status.state == next || !status.state.can_transition_to(&next) {
                return false;
            }
            if next.is_connected() {
                status.session += 1;
            }
            from = Some(std::mem::replace(&mut status.state, next.clone()));
            true
        });

        let Some(from) = from else {
            return false;
        };

        match &next {
            ConnectionState::Connected => {
                let session = self.status.borrow().session;
                tracing::info!(from = from.as_str(), session, "Channel connected");
            }
            ConnectionState::Disconnected => {
                tracing::info!(from = from.as_str(), "Channel disconnected");
            }
            other => {
                tracing::debug!(
                    from = from.as_str(),
                    to = other.as_str(),
                    "Connection state changed"
                );
            }
        }

        self.bus.publish(EngineEvent::ConnectionChanged(next));
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}
