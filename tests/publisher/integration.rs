use std::collections::HashMap;
use std::time::Duration;

use cellwatch_publisher::{
    ConnectionState, InboundMessage, MemoryTransport, PublishError, PublishOutcome,
    TransportError,
};
use serde_json::json;
use tokio::sync::mpsc;
use tower::BoxError;

use super::{client, config, eventually, params};

#[tokio::test(start_paused = true)]
async fn publishes_immediately_while_connected() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params().topic_prefix("van-7"), config());
    client.connect().await.unwrap();

    let outcome = client
        .publish("devices/bmv/reading", json!({ "voltage": 12.9 }), false)
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Delivered);
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "van-7/devices/bmv/reading");
    assert_eq!(published[0].text(), Some(r#"{"voltage":12.9}"#));
    assert_eq!(client.stats().stats.messages_published, 1);
    assert_eq!(client.stats().queue_size, 0);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn queued_messages_flush_in_order_after_connect() {
    let transport = MemoryTransport::new();
    let client = client(
        &transport,
        params(),
        config().queue_capacity(2).message_retry_limit(1),
    );

    for topic in ["a", "b", "c"] {
        let outcome = client.publish(topic, "x", false).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
    }
    let queued: Vec<String> = client
        .queued_messages()
        .iter()
        .map(|m| m.topic().to_string())
        .collect();
    assert_eq!(queued, ["b", "c"]);
    assert_eq!(client.stats().stats.messages_evicted, 1);

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published_topics().len() == 2).await);

    assert_eq!(transport.published_topics(), ["b", "c"]);
    let stats = client.stats();
    assert_eq!(stats.stats.messages_published, 2);
    assert_eq!(stats.queue_size, 0);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn failed_head_blocks_the_rest_until_next_flush() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config().message_retry_limit(3));

    client.publish("a", "1", false).await.unwrap();
    client.publish("b", "2", false).await.unwrap();
    transport.fail_publishes(1, TransportError::Connection("broker busy".into()));

    client.connect().await.unwrap();
    // Hold the replacement session back for one backoff step.
    transport.fail_connects(1, TransportError::Connection("refused".into()));
    assert!(eventually(|| !transport.publish_attempts().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.publish_attempts(), ["a"]);
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    let queued = client.queued_messages();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].topic(), "a");
    assert_eq!(queued[0].retry_count(), 1);
    assert_eq!(queued[1].retry_count(), 0);

    assert!(eventually(|| transport.published_topics() == ["a", "b"]).await);
    assert_eq!(transport.publish_attempts(), ["a", "a", "b"]);
    assert_eq!(client.stats().stats.total_reconnections, 1);
    assert_eq!(client.stats().queue_size, 0);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connection_error_on_publish_starts_reconnection() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();
    transport.fail_publishes(1, TransportError::Connection("socket reset".into()));

    let outcome = client.publish("a", "1", false).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Queued);
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert_eq!(client.stats().stats.total_reconnections, 1);

    assert!(eventually(|| transport.published_topics() == ["a"]).await);
    assert!(client.is_connected());
    let stats = client.stats().stats;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(transport.closed_sessions(), 1);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn dead_session_reconnects_before_retries_run_out() {
    let transport = MemoryTransport::new();
    // Health probes and periodic flushes are far apart, as in production.
    let client = client(
        &transport,
        params(),
        config()
            .message_retry_limit(3)
            .health_check_interval(Duration::from_secs(30))
            .flush_interval(Duration::from_secs(5)),
    );
    client.connect().await.unwrap();
    transport.fail_publishes(2, TransportError::Connection("socket reset".into()));

    client.publish("a", "1", false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(transport.published_topics(), ["a"]);
    let stats = client.stats();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.stats.total_reconnections, 2);
    assert_eq!(stats.stats.messages_failed, 0);
    assert_eq!(stats.queue_size, 0);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_messages_are_dropped_not_retried() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());

    client.publish("bad", "1", false).await.unwrap();
    client.publish("good", "2", false).await.unwrap();
    transport.fail_publishes(1, TransportError::Rejected("not authorized".into()));

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published_topics() == ["good"]).await);

    let stats = client.stats().stats;
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.messages_published, 1);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn serialization_errors_are_returned_and_not_queued() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());

    let mut readings = HashMap::new();
    readings.insert((1u8, 2u8), 12.5f64);
    let err = client
        .publish_serialized("devices/x/reading", &readings, false)
        .await
        .unwrap_err();

    assert!(err.is_serialization_error());
    assert_eq!(client.stats().queue_size, 0);
    assert_eq!(client.stats().stats.messages_queued, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_exhaustion_reports_last_error() {
    let transport = MemoryTransport::new();
    transport.fail_connects(3, TransportError::Connection("refused".into()));
    let client = client(&transport, params(), config().max_retries(3));

    let err = client.connect().await.unwrap_err();

    assert!(err.is_connection_error());
    assert!(err.to_string().contains("mqtt://memory:1883"));
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(client.stats().consecutive_failures(), 3);
    assert!(client.stats().stats.last_attempt.is_some());

    // A later connect starts a fresh sequence.
    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.stats().consecutive_failures(), 0);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_interrupts_a_pending_connect() {
    let transport = MemoryTransport::new();
    transport.set_connect_delay(Some(Duration::from_millis(500)));
    let client = client(&transport, params(), config());

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    assert!(eventually(|| client.state() == ConnectionState::Connecting).await);

    client.disconnect().await;
    let result = connecting.await.unwrap();

    assert!(matches!(result, Err(PublishError::Shutdown)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.active_tasks(), 0);

    transport.set_connect_delay(None);
    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn lost_session_reconnects_and_restores_subscriptions() {
    let transport = MemoryTransport::new();
    let client = client(
        &transport,
        params().topic_prefix("van-7"),
        config().health_check_interval(Duration::from_secs(1)),
    );
    client.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    client
        .subscribe(
            "cmd/#",
            tower::service_fn(move |message: InboundMessage| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(transport.subscriptions(), ["van-7/cmd/#"]);

    transport.drop_connections();
    assert!(transport.subscriptions().is_empty());

    assert!(
        eventually(|| client.is_connected() && client.stats().stats.total_reconnections == 1)
            .await
    );
    assert!(eventually(|| transport.subscriptions() == ["van-7/cmd/#"]).await);
    assert_eq!(client.stats().stats.total_connections, 2);
    assert_eq!(transport.closed_sessions(), 1);

    assert_eq!(transport.inject("van-7/cmd/reset", "now"), 1);
    let message = rx.recv().await.unwrap();
    assert_eq!(message.topic, "van-7/cmd/reset");
    assert_eq!(message.text(), Some("now"));

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_exhaustion_leaves_client_failed() {
    let transport = MemoryTransport::new();
    let client = client(
        &transport,
        params(),
        config()
            .max_retries(2)
            .health_check_interval(Duration::from_secs(1)),
    );
    client.connect().await.unwrap();

    transport.fail_connects(2, TransportError::Connection("refused".into()));
    transport.drop_connections();

    assert!(eventually(|| client.state() == ConnectionState::Failed).await);
    assert_eq!(transport.connect_attempts(), 3);

    // Publishing still works: the message waits for the next session.
    let outcome = client.publish("devices/a/reading", "1", false).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published_topics() == ["devices/a/reading"]).await);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_stop_dispatch() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();

    client
        .subscribe(
            "sensors/#",
            tower::service_fn(|_message: InboundMessage| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<(), BoxError>(())
            }),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    client
        .subscribe(
            "sensors/temp",
            tower::service_fn(move |message: InboundMessage| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.text().unwrap_or_default().to_string());
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .await
        .unwrap();

    transport.inject("sensors/temp", "21.5");
    transport.inject("sensors/temp", "21.7");

    assert_eq!(rx.recv().await.unwrap(), "21.5");
    assert_eq!(rx.recv().await.unwrap(), "21.7");
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_removes_the_handler() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());

    let noop = tower::service_fn(|_message: InboundMessage| async { Ok::<(), BoxError>(()) });
    assert!(matches!(
        client.subscribe("cmd/#", noop.clone()).await,
        Err(PublishError::NotConnected)
    ));

    client.connect().await.unwrap();
    assert!(matches!(
        client.subscribe("cmd/#/oops", noop.clone()).await,
        Err(PublishError::Rejected(_))
    ));
    client.subscribe("cmd/#", noop).await.unwrap();
    client.unsubscribe("cmd/#").await.unwrap();

    assert!(transport.subscriptions().is_empty());
    assert_eq!(transport.inject("cmd/reset", "now"), 0);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_publisher_never_connects() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params().enabled(false), config());

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connect_attempts(), 0);
    let outcome = client.publish("devices/a/reading", "1", false).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);
}

#[tokio::test(start_paused = true)]
async fn retained_status_announces_online_and_offline() {
    let transport = MemoryTransport::new();
    let client = client(
        &transport,
        params().topic_prefix("van-7").announce_status(true),
        config(),
    );

    client.connect().await.unwrap();
    let online = transport.published();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].topic, "van-7/status");
    assert_eq!(online[0].text(), Some("online"));
    assert!(online[0].retain);

    client.disconnect().await;
    let offline = transport.published();
    assert_eq!(offline.len(), 2);
    assert_eq!(offline[1].topic, "van-7/status");
    assert_eq!(offline[1].text(), Some("offline"));
    assert!(offline[1].retain);
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_timeout_reconnects_and_redelivers() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());

    client.publish("a", "1", false).await.unwrap();
    transport.fail_publishes(1, TransportError::Timeout(Duration::from_secs(1)));
    client.connect().await.unwrap();

    assert!(eventually(|| transport.published_topics() == ["a"]).await);
    assert_eq!(transport.publish_attempts(), ["a", "a"]);
    assert_eq!(client.stats().stats.total_reconnections, 1);
    assert_eq!(client.queued_messages().len(), 0);

    client.disconnect().await;
}
