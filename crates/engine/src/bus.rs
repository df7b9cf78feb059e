//! Engine-scoped publish/subscribe bus
//!
//! Components publish what happened; the presentation layer (status
//! indicators, notification sounds, banners) subscribes. Nothing here is
//! process-global: each engine owns exactly one bus and hands clones of it to
//! the components it builds.

use tokio::sync::broadcast;

use ticketsync_shared::{Message, MessageId, TicketId};

use crate::connection::ConnectionState;

/// Events published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Connection state machine moved
    ConnectionChanged(ConnectionState),

    /// A genuinely new message landed on a timeline (drives sounds/toasts)
    MessageReceived { ticket_id: TicketId, message: Message },

    /// A timeline changed in any way
    TimelineUpdated { ticket_id: TicketId },

    /// Bulk load or poll failed; the timeline keeps its last good state
    LoadFailed { ticket_id: TicketId, error: String },

    /// A send resolved as failed
    SendFailed {
        ticket_id: TicketId,
        message_id: MessageId,
        error: String,
    },

    /// Remote typing set for a ticket changed
    TypingChanged { ticket_id: TicketId },
}

/// Broadcast bus shared by all components of one engine
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Engine event dropped - no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EngineEvent::TimelineUpdated {
            ticket_id: TicketId::new("T1"),
        });

        assert!(matches!(a.recv().await, Ok(EngineEvent::TimelineUpdated { .. })));
        assert!(matches!(b.recv().await, Ok(EngineEvent::TimelineUpdated { .. })));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::ConnectionChanged(ConnectionState::Connecting));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
