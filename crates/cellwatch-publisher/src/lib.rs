//! Resilient broker publishing for battery monitor telemetry.
//!
//! `cellwatch-publisher` owns the lifecycle of a broker session and keeps
//! telemetry flowing through outages:
//!
//! - **Connection manager**: a single-writer state machine
//!   (`Disconnected → Connecting → Connected → Reconnecting → Failed`) with
//!   bounded, jittered retry loops
//! - **Message queue**: a bounded FIFO that buffers publishes while the
//!   broker is unreachable and flushes them in order once it is back
//! - **Task supervisor**: health checks, queue flushing, inbound dispatch and
//!   reconnection run as tracked tasks that `disconnect()` cancels and joins
//! - **Config watcher**: applies live settings changes, reconnecting on a
//!   separate task when the broker identity changes
//! - **Event system**: listeners for state transitions and queue activity
//!
//! The wire protocol is abstracted behind [`BrokerTransport`];
//! [`MemoryTransport`] is an in-process implementation with fault injection.
//!
//! # Example
//!
//! ```
//! use cellwatch_publisher::{
//!     BrokerClient, ConnectionParams, MemoryTransport, ReconnectionConfig, TelemetryPublisher,
//!     BatteryReading,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), cellwatch_publisher::PublishError> {
//! let client = BrokerClient::builder(MemoryTransport::new())
//!     .params(
//!         ConnectionParams::builder("broker.local", 1883)
//!             .client_id("van-gateway")
//!             .topic_prefix("fleet/van-7")
//!             .build()?,
//!     )
//!     .reconnection(
//!         ReconnectionConfig::builder()
//!             .max_retries(5)
//!             .initial_retry_delay(Duration::from_millis(500))
//!             .queue_capacity(500)
//!             .build()?,
//!     )
//!     .on_state_change(|from, to| println!("{from} -> {to}"))
//!     .build()?;
//!
//! client.connect().await?;
//!
//! let telemetry = TelemetryPublisher::new(client.clone());
//! telemetry
//!     .publish_reading(&BatteryReading {
//!         device_id: "bmv-712".into(),
//!         timestamp: chrono::Utc::now(),
//!         voltage: 13.2,
//!         current: 4.1,
//!         state_of_charge: Some(92.0),
//!         temperature: None,
//!     })
//!     .await?;
//!
//! assert_eq!(client.stats().stats.messages_published, 1);
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `metrics`: record counters and a queue-depth gauge through the
//!   [`metrics`](https://docs.rs/metrics) facade

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
#[cfg(feature = "metrics")]
use std::sync::Once;

mod client;
mod config;
mod error;
mod events;
mod manager;
mod memory;
mod payload;
mod queue;
mod state;
mod supervisor;
mod telemetry;
pub mod topic;
mod transport;
mod watcher;

pub use client::{
    BrokerClient, BrokerClientBuilder, FlushReport, MessageHandler, PublishOutcome,
};
pub use config::{
    BrokerSettings, ConnectionParams, ConnectionParamsBuilder, Credentials, OverflowPolicy, QoS,
    ReconnectionConfig, ReconnectionConfigBuilder, TlsSettings,
};
pub use error::{ConfigError, PublishError, TransportError};
pub use events::{ClientEvent, EventListener, EventListeners, FnListener};
pub use manager::{SettingsChange, STATUS_TOPIC};
pub use memory::{MemorySession, MemoryTransport, PublishedMessage};
pub use payload::Payload;
pub use queue::{MessageQueue, QueueFull, QueuedMessage, RetryOutcome};
pub use state::{ConnectionState, ConnectionStats, StatsSnapshot};
pub use supervisor::TaskKind;
pub use telemetry::{device_topic, BatteryReading, BatterySummary, DeviceStatus, TelemetryPublisher};
pub use transport::{BrokerTransport, InboundMessage, InboundStream};
pub use watcher::{ConfigChange, ConfigSource, ConfigWatcher, MemoryConfigSource, DEFAULT_SECTION};

pub use cellwatch_backoff::{RetryScheduler, MIN_RETRY_DELAY};

// Poisoning only means another thread panicked mid-update; every guarded
// value stays structurally valid, so keep going.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

pub(crate) fn describe_metrics() {
    #[cfg(feature = "metrics")]
    {
        use metrics::{describe_counter, describe_gauge};

        METRICS_INIT.call_once(|| {
            describe_counter!(
                "cellwatch_messages_published_total",
                "Messages accepted by the broker transport"
            );
            describe_counter!(
                "cellwatch_messages_queued_total",
                "Messages buffered while the broker was unavailable"
            );
            describe_counter!(
                "cellwatch_messages_failed_total",
                "Queued messages dropped after delivery failures"
            );
            describe_counter!(
                "cellwatch_messages_evicted_total",
                "Queued messages evicted to respect the queue capacity"
            );
            describe_counter!(
                "cellwatch_state_transitions_total",
                "Connection state transitions"
            );
            describe_gauge!("cellwatch_queue_depth", "Messages waiting in the outbound queue");
        });
    }
}
