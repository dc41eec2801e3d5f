//! Connection state and cumulative statistics.

use std::fmt;
use std::time::SystemTime;

/// Lifecycle state of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Disconnected,
    /// A caller-invoked `connect()` is attempting to establish a session.
    Connecting,
    /// A session is established.
    Connected,
    /// The session was lost and the background reconnect loop is running.
    Reconnecting,
    /// Connection attempts were exhausted.
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Disconnected` is reachable from every state; everything else follows
    /// the connect / lose / recover / exhaust paths.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
        )
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative counters maintained by the connection manager.
///
/// Every counter only grows, except `consecutive_failures`, which resets to
/// zero when a session is established.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Sessions successfully established.
    pub total_connections: u64,
    /// Transitions into `Disconnected` from any other state.
    pub total_disconnections: u64,
    /// Reconnect sequences started after a lost session.
    pub total_reconnections: u64,
    /// Messages handed to the transport successfully.
    pub messages_published: u64,
    /// Messages that entered the outbound queue.
    pub messages_queued: u64,
    /// Messages dropped after a terminal delivery failure or retry exhaustion.
    pub messages_failed: u64,
    /// Messages evicted from the queue to make room.
    pub messages_evicted: u64,
    /// Connection attempts failed since the last successful one.
    pub consecutive_failures: u32,
    /// Wall-clock time of the most recent connection attempt.
    pub last_attempt: Option<SystemTime>,
}

/// A consistent, read-only view of the client for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// State at the moment the snapshot was taken.
    pub state: ConnectionState,
    /// Messages waiting in the outbound queue.
    pub queue_size: usize,
    /// Configured queue capacity.
    pub queue_capacity: usize,
    /// Counters read together with `state`.
    pub stats: ConnectionStats,
}

impl StatsSnapshot {
    /// Connection attempts failed since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures
    }
}
