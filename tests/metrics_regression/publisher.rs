//! Publisher metrics regression tests

use super::helpers::*;
use cellwatch_publisher::{
    BrokerClient, ConnectionParams, MemoryTransport, ReconnectionConfig, TransportError,
};
use serial_test::serial;
use std::time::Duration;

fn client(transport: &MemoryTransport, capacity: usize) -> BrokerClient<MemoryTransport> {
    BrokerClient::builder(transport.clone())
        .params(
            ConnectionParams::builder("memory", 1883)
                .announce_status(false)
                .build()
                .unwrap(),
        )
        .reconnection(
            ReconnectionConfig::builder()
                .max_retries(1)
                .queue_capacity(capacity)
                .message_retry_limit(0)
                .flush_interval(Duration::from_secs(3600))
                .health_check_interval(Duration::from_secs(3600))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn state_transition_metrics_exist() {
    init_recorder();

    let transport = MemoryTransport::new();
    let client = client(&transport, 10);
    client.connect().await.unwrap();
    client.disconnect().await;

    assert_counter_exists("cellwatch_state_transitions_total");
    assert_metric_has_label("cellwatch_state_transitions_total", "from", "disconnected");
    assert_metric_has_label("cellwatch_state_transitions_total", "to", "connecting");
    assert_metric_has_label("cellwatch_state_transitions_total", "to", "connected");
    assert_metric_has_label("cellwatch_state_transitions_total", "from", "connected");
}

#[tokio::test]
#[serial]
async fn failed_connect_records_failed_state() {
    init_recorder();

    let transport = MemoryTransport::new();
    transport.fail_connects(1, TransportError::Connection("refused".into()));
    let client = client(&transport, 10);
    assert!(client.connect().await.is_err());

    assert_metric_has_label("cellwatch_state_transitions_total", "to", "failed");
}

#[tokio::test]
#[serial]
async fn queue_metrics_exist() {
    init_recorder();

    let transport = MemoryTransport::new();
    let client = client(&transport, 1);
    client.publish("a", "1", false).await.unwrap();
    client.publish("b", "2", false).await.unwrap();

    assert_counter_exists("cellwatch_messages_queued_total");
    assert_counter_exists("cellwatch_messages_evicted_total");
    assert_gauge_exists("cellwatch_queue_depth");
    assert!(counter_total("cellwatch_messages_evicted_total") >= 1);
}

#[tokio::test]
#[serial]
async fn delivery_metrics_exist() {
    init_recorder();

    let transport = MemoryTransport::new();
    let client = client(&transport, 10);
    client.publish("doomed", "1", false).await.unwrap();
    client.publish("fine", "2", false).await.unwrap();
    transport.fail_publishes(1, TransportError::Connection("broker busy".into()));

    client.connect().await.unwrap();
    client.flush().await;
    for _ in 0..100 {
        if transport.published_topics() == ["fine"] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.published_topics(), ["fine"]);

    assert_counter_exists("cellwatch_messages_published_total");
    assert_counter_exists("cellwatch_messages_failed_total");
    assert!(counter_total("cellwatch_messages_published_total") >= 1);

    client.disconnect().await;
}
