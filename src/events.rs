//! In-process event bus for session lifecycle notifications
//!
//! Embedders observe the session (UI, metrics) through listeners registered
//! per event kind, without coupling to internal state. Listeners for a kind
//! run in registration order; the table lives for the session and is cleared
//! on teardown.

use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Event kinds exposed to embedders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The relay connection is established and the room was joined
    Start,
    /// The relay closed, or a given peer's media ended
    End,
    /// A recoverable fault occurred
    Error,
    /// A raw inbound envelope was processed (observability)
    SignalMessage,
    /// A peer's media attached
    Connected,
    /// A peer session's negotiation handle was created
    FoundRemote,
}

/// A session lifecycle event with its payload
#[derive(Debug)]
pub enum RoomEvent {
    /// Relay connected, join announced
    Start,

    /// Session or peer ended; `peer_id` is `None` when the relay itself
    /// closed, and names the peer when that peer's media ended
    End {
        /// Peer whose media ended, if any
        peer_id: Option<String>,
    },

    /// Recoverable fault, processing continues
    Error {
        /// Peer the fault relates to, if any
        peer_id: Option<String>,
        /// The fault itself
        error: Error,
    },

    /// Raw inbound signaling envelope
    SignalMessage {
        /// The envelope as parsed JSON
        raw: Value,
    },

    /// A peer's media attached and the peer link is live
    Connected {
        /// The connected peer
        peer_id: String,
    },

    /// A negotiation handle was created for a newly observed peer
    FoundRemote {
        /// The discovered peer
        peer_id: String,
    },
}

impl RoomEvent {
    /// The kind this event is dispatched under
    pub fn kind(&self) -> EventKind {
        match self {
            RoomEvent::Start => EventKind::Start,
            RoomEvent::End { .. } => EventKind::End,
            RoomEvent::Error { .. } => EventKind::Error,
            RoomEvent::SignalMessage { .. } => EventKind::SignalMessage,
            RoomEvent::Connected { .. } => EventKind::Connected,
            RoomEvent::FoundRemote { .. } => EventKind::FoundRemote,
        }
    }
}

/// Listener callback invoked with a borrowed event
pub type Listener = Arc<dyn Fn(&RoomEvent) + Send + Sync>;

/// Ordered listener table keyed by event kind
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for an event kind
    ///
    /// Listeners for a kind are invoked in registration order.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke every listener registered for the event's kind
    pub fn emit(&self, event: &RoomEvent) {
        debug!(kind = ?event.kind(), "Emitting session event");

        // Snapshot under the lock so a listener may register listeners.
        let snapshot: Vec<Listener> = {
            let table = self.listeners.lock().expect("listener table poisoned");
            table.get(&event.kind()).cloned().unwrap_or_default()
        };

        for listener in snapshot {
            listener(event);
        }
    }

    /// Drop every registered listener
    pub fn clear(&self) {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .clear();
    }

    /// Number of listeners registered for a kind
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }
}
