//! Error types for the publishing client.

use std::time::Duration;

use cellwatch_backoff::BackoffError;
use thiserror::Error;

/// Invalid or missing connection parameters. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The broker host is empty.
    #[error("broker host must not be empty")]
    MissingHost,

    /// The broker port is zero.
    #[error("broker port must be non-zero")]
    InvalidPort,

    /// The client identifier is empty.
    #[error("client id must not be empty")]
    MissingClientId,

    /// The outbound queue cannot hold a single message.
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    /// A periodic loop was configured with a zero period.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// The retry policy is internally inconsistent.
    #[error("invalid retry policy: {0}")]
    Backoff(#[from] BackoffError),

    /// A live settings document could not be decoded.
    #[error("invalid settings document: {0}")]
    Settings(#[source] serde_json::Error),
}

/// Failure reported by a [`BrokerTransport`](crate::BrokerTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The session could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused this particular request; retrying cannot help.
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether a later attempt of the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Errors surfaced to callers of the client.
///
/// Background activity (health checks, scheduled flushes, autonomous
/// reconnection) never returns these to unrelated callers; it logs them and
/// updates counters instead.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Invalid or missing connection parameters.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The broker session could not be established or maintained.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection {
        /// Broker endpoint the client was talking to.
        endpoint: String,
        /// Last cause reported by the transport.
        reason: String,
    },

    /// A transport operation exceeded its deadline.
    #[error("connection to {endpoint} timed out after {after:?}")]
    Timeout {
        /// Broker endpoint the client was talking to.
        endpoint: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The payload could not be converted to wire format.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation requires an established session.
    #[error("not connected to broker")]
    NotConnected,

    /// Strict overflow mode refused a message instead of evicting.
    #[error("outbound queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The broker refused a subscribe or unsubscribe request.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// A connection attempt was interrupted by `disconnect()`.
    #[error("client is shutting down")]
    Shutdown,
}

impl PublishError {
    pub(crate) fn from_transport(endpoint: &str, error: TransportError) -> Self {
        match error {
            TransportError::Connection(reason) => PublishError::Connection {
                endpoint: endpoint.to_string(),
                reason,
            },
            TransportError::Timeout(after) => PublishError::Timeout {
                endpoint: endpoint.to_string(),
                after,
            },
            TransportError::Rejected(reason) => PublishError::Rejected(reason),
        }
    }

    /// True for errors that feed the retry/backoff path: connection
    /// failures, timeouts, and operations attempted while disconnected.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PublishError::Connection { .. } | PublishError::Timeout { .. } | PublishError::NotConnected
        )
    }

    /// True if the error is a payload serialization failure.
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, PublishError::Serialization(_))
    }
}
