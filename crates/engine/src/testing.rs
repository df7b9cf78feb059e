//! Test doubles shared by the unit tests

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use ticketsync_shared::{IncomingMessage, MessageId, MessageStatus, Sender, TicketId};

use crate::channel::events::{ChannelCommand, SendMessagePayload};
use crate::channel::transport::{ChannelTransport, MessageLoader};
use crate::error::{LoadError, TransportError};

/// How the fake channel answers `message:send`
#[derive(Debug, Clone)]
pub(crate) enum AckMode {
    Echo,
    Reject(String),
    Hang,
}

pub(crate) struct FakeTransport {
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    commands: Mutex<Vec<ChannelCommand>>,
    sends: Mutex<Vec<SendMessagePayload>>,
    ack_mode: Mutex<AckMode>,
    next_server_id: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            ack_mode: Mutex::new(AckMode::Echo),
            next_server_id: AtomicUsize::new(1),
        }
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<ChannelCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn sends(&self) -> Vec<SendMessagePayload> {
        self.sends.lock().unwrap().clone()
    }

    pub(crate) fn set_ack_mode(&self, mode: AckMode) {
        *self.ack_mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Io("connection refused".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {}

    async fn emit(&self, command: ChannelCommand) -> Result<(), TransportError> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    async fn send_message(
        &self,
        payload: SendMessagePayload,
    ) -> Result<IncomingMessage, TransportError> {
        self.sends.lock().unwrap().push(payload.clone());
        let mode = self.ack_mode.lock().unwrap().clone();

        match mode {
            AckMode::Echo => {
                let n = self.next_server_id.fetch_add(1, Ordering::SeqCst);
                Ok(IncomingMessage {
                    id: Some(MessageId::new(format!("s{n}"))),
                    ticket_id: Some(payload.ticket_id),
                    content: Some(payload.content),
                    sender: Some(Sender::Agent),
                    sender_name: Some("Agent".to_string()),
                    timestamp: OffsetDateTime::now_utc()
                        .format(&Rfc3339)
                        .ok()
                        .map(Value::String),
                    is_internal: Some(payload.is_internal),
                    kind: Some("text".to_string()),
                    metadata: None,
                    status: Some(MessageStatus::Sent),
                })
            }
            AckMode::Reject(reason) => Err(TransportError::Rejected(reason)),
            AckMode::Hang => std::future::pending().await,
        }
    }
}

pub(crate) struct FakeLoader {
    messages: Mutex<Vec<IncomingMessage>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeLoader {
    pub(crate) fn new(messages: Vec<IncomingMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn set_messages(&self, messages: Vec<IncomingMessage>) {
        *self.messages.lock().unwrap() = messages;
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageLoader for FakeLoader {
    async fn load_messages(
        &self,
        _ticket_id: &TicketId,
    ) -> Result<Vec<IncomingMessage>, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(LoadError::Request("503 Service Unavailable".to_string()));
        }
        Ok(self.messages.lock().unwrap().clone())
    }
}

/// Wire message at `2025-03-01T10:00:00Z + offset_secs`
pub(crate) fn incoming(
    id: &str,
    content: &str,
    offset_secs: i64,
    status: MessageStatus,
) -> IncomingMessage {
    let base = time::macros::datetime!(2025-03-01 10:00:00 UTC);
    let timestamp = base + time::Duration::seconds(offset_secs);

    IncomingMessage {
        id: Some(MessageId::new(id)),
        ticket_id: None,
        content: Some(content.to_string()),
        sender: Some(Sender::Client),
        sender_name: Some("Maria".to_string()),
        timestamp: timestamp.format(&Rfc3339).ok().map(Value::String),
        is_internal: Some(false),
        kind: Some("text".to_string()),
        metadata: None,
        status: Some(status),
    }
}
