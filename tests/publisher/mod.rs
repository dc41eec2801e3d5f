//! Publishing client tests.
//!
//! Test organization:
//! - integration.rs: publish path, flushing, reconnection and subscriptions
//! - queue.rs: overflow and retry behaviour seen through the client
//! - state.rs: state machine transitions and statistics
//! - config_watch.rs: live settings changes
//! - telemetry.rs: battery telemetry documents and topics

mod config_watch;
mod integration;
mod queue;
mod state;
mod telemetry;

use std::time::Duration;

use cellwatch_publisher::{
    BrokerClient, ConnectionParams, ConnectionParamsBuilder, MemoryTransport, ReconnectionConfig,
    ReconnectionConfigBuilder,
};

/// Default parameters for the in-memory broker.
pub(crate) fn params() -> ConnectionParamsBuilder {
    ConnectionParams::builder("memory", 1883)
}

/// Short retry delays and long periodic intervals, so only the events a test
/// triggers cause flushes or health probes.
pub(crate) fn config() -> ReconnectionConfigBuilder {
    ReconnectionConfig::builder()
        .max_retries(3)
        .initial_retry_delay(Duration::from_millis(100))
        .max_retry_delay(Duration::from_millis(400))
        .jitter_factor(0.0)
        .connection_timeout(Duration::from_secs(1))
        .health_check_interval(Duration::from_secs(3600))
        .flush_interval(Duration::from_secs(3600))
}

pub(crate) fn client(
    transport: &MemoryTransport,
    params: ConnectionParamsBuilder,
    config: ReconnectionConfigBuilder,
) -> BrokerClient<MemoryTransport> {
    BrokerClient::builder(transport.clone())
        .params(params.build().unwrap())
        .reconnection(config.build().unwrap())
        .build()
        .unwrap()
}

/// Polls `condition` until it holds, letting background tasks run between
/// checks. Returns the final result.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
