//! Session events - the publish step that follows every observable mutation.
//!
//! The presentation layer never polls session internals. It subscribes to a
//! [`SessionHandle`](crate::SessionHandle) and re-renders on each
//! [`SessionEvent`], in the order they were published.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::SessionSnapshot;

/// Default per-session channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Notification sent to every subscriber of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Bring the bottom of the conversation into view.
    ScrollIntoView,
    /// The session changed; `state` is the full observable surface after the change.
    StateChanged { state: SessionSnapshot },
}

impl SessionEvent {
    /// Event name used on the wire (SSE `event:` field).
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ScrollIntoView => "scroll_into_view",
            SessionEvent::StateChanged { .. } => "state_changed",
        }
    }
}

/// In-process fan-out for one session, based on a tokio broadcast channel.
#[derive(Debug)]
pub struct EventPublisher {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
