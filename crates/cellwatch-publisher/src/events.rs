//! Event system for observing the client.
//!
//! Listeners receive state transitions, failed connection attempts and
//! queue activity. They run synchronously on the emitting task, after any
//! internal lock has been released, so they may call back into the client.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::state::ConnectionState;

/// Events emitted by the publishing client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection state changed.
    StateTransition {
        timestamp: Instant,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A connection attempt failed. `retry_in` is `None` on the last attempt.
    ConnectAttemptFailed {
        timestamp: Instant,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },
    /// A message entered the outbound queue.
    MessageQueued {
        timestamp: Instant,
        topic: String,
        queue_len: usize,
    },
    /// The oldest queued message was evicted to make room.
    MessageEvicted { timestamp: Instant, topic: String },
    /// A message reached the transport.
    MessageDelivered {
        timestamp: Instant,
        topic: String,
        from_queue: bool,
    },
    /// A queued message was given up on.
    MessageDropped {
        timestamp: Instant,
        topic: String,
        retries: u32,
        reason: String,
    },
}

impl ClientEvent {
    /// Short machine-readable label for the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::StateTransition { .. } => "state_transition",
            ClientEvent::ConnectAttemptFailed { .. } => "connect_attempt_failed",
            ClientEvent::MessageQueued { .. } => "message_queued",
            ClientEvent::MessageEvicted { .. } => "message_evicted",
            ClientEvent::MessageDelivered { .. } => "message_delivered",
            ClientEvent::MessageDropped { .. } => "message_dropped",
        }
    }

    /// When the event occurred.
    pub fn timestamp(&self) -> Instant {
        match self {
            ClientEvent::StateTransition { timestamp, .. }
            | ClientEvent::ConnectAttemptFailed { timestamp, .. }
            | ClientEvent::MessageQueued { timestamp, .. }
            | ClientEvent::MessageEvicted { timestamp, .. }
            | ClientEvent::MessageDelivered { timestamp, .. }
            | ClientEvent::MessageDropped { timestamp, .. } => *timestamp,
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::StateTransition { from, to, .. } => write!(f, "{from} -> {to}"),
            ClientEvent::ConnectAttemptFailed { attempt, error, .. } => {
                write!(f, "attempt {attempt} failed: {error}")
            }
            ClientEvent::MessageQueued { topic, queue_len, .. } => {
                write!(f, "queued {topic} ({queue_len} waiting)")
            }
            ClientEvent::MessageEvicted { topic, .. } => write!(f, "evicted {topic}"),
            ClientEvent::MessageDelivered { topic, .. } => write!(f, "delivered {topic}"),
            ClientEvent::MessageDropped { topic, reason, .. } => {
                write!(f, "dropped {topic}: {reason}")
            }
        }
    }
}

/// Receives [`ClientEvent`]s.
pub trait EventListener: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ClientEvent);
}

/// A listener backed by a closure.
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    /// Wraps a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    fn on_event(&self, event: &ClientEvent) {
        (self.f)(event)
    }
}

/// A collection of event listeners.
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventListeners {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to every listener.
    ///
    /// A panicking listener is skipped; the others still run.
    pub fn emit(&self, event: &ClientEvent) {
        for listener in &self.listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
            if result.is_err() {
                tracing::warn!(event = event.event_type(), "event listener panicked");
            }
        }
    }

    /// True if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}
