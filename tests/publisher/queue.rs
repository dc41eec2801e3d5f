use std::sync::{Arc, Mutex};

use cellwatch_publisher::{
    BrokerClient, ClientEvent, FnListener, MemoryTransport, OverflowPolicy, PublishError,
    PublishOutcome, TransportError,
};

use super::{client, config, eventually, params};

#[tokio::test(start_paused = true)]
async fn strict_overflow_rejects_new_messages() {
    let transport = MemoryTransport::new();
    let client = client(
        &transport,
        params(),
        config().queue_capacity(1).overflow(OverflowPolicy::Reject),
    );

    assert_eq!(
        client.publish("a", "1", false).await.unwrap(),
        PublishOutcome::Queued
    );
    let err = client.publish("b", "2", false).await.unwrap_err();

    assert!(matches!(err, PublishError::QueueFull { capacity: 1 }));
    let queued = client.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].topic(), "a");
    assert_eq!(client.stats().stats.messages_evicted, 0);
}

#[tokio::test(start_paused = true)]
async fn eviction_is_reported_to_listeners() {
    let transport = MemoryTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = BrokerClient::builder(transport.clone())
        .params(params().build().unwrap())
        .reconnection(config().queue_capacity(2).build().unwrap())
        .on_event(FnListener::new({
            let seen = Arc::clone(&seen);
            move |event: &ClientEvent| seen.lock().unwrap().push(event.to_string())
        }))
        .build()
        .unwrap();

    for topic in ["a", "b", "c"] {
        client.publish(topic, "x", false).await.unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        [
            "queued a (1 waiting)",
            "queued b (2 waiting)",
            "evicted a",
            "queued c (2 waiting)",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn message_dropped_after_retry_limit() {
    let transport = MemoryTransport::new();
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let client = BrokerClient::builder(transport.clone())
        .params(params().build().unwrap())
        .reconnection(config().message_retry_limit(1).build().unwrap())
        .on_event(FnListener::new({
            let dropped = Arc::clone(&dropped);
            move |event: &ClientEvent| {
                if let ClientEvent::MessageDropped { topic, retries, .. } = event {
                    dropped.lock().unwrap().push((topic.clone(), *retries));
                }
            }
        }))
        .build()
        .unwrap();

    client.publish("a", "1", false).await.unwrap();
    client.publish("b", "2", false).await.unwrap();
    transport.fail_publishes(2, TransportError::Connection("broker busy".into()));

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published_topics() == ["b"]).await);

    assert_eq!(transport.publish_attempts(), ["a", "a", "b"]);
    assert_eq!(*dropped.lock().unwrap(), [("a".to_string(), 1)]);

    let stats = client.stats().stats;
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.messages_published, 1);
    // Each connection-type failure replaced the session.
    assert_eq!(stats.total_reconnections, 2);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn fresh_publishes_wait_behind_the_backlog() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());

    client.publish("old", "1", false).await.unwrap();
    transport.fail_publishes(1, TransportError::Connection("broker busy".into()));
    client.connect().await.unwrap();
    transport.fail_connects(1, TransportError::Connection("refused".into()));
    assert!(eventually(|| transport.publish_attempts().len() == 1).await);

    // The queue is not empty, so this one is queued behind "old".
    let outcome = client.publish("new", "2", false).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);

    assert!(eventually(|| transport.published_topics().len() == 2).await);
    assert_eq!(transport.published_topics(), ["old", "new"]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn flush_without_session_does_nothing() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.publish("a", "1", false).await.unwrap();

    let report = client.flush().await;

    assert_eq!(report.delivered, 0);
    assert!(!report.skipped);
    assert_eq!(client.stats().queue_size, 1);
    assert!(transport.publish_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_queued_messages() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();
    transport.fail_publishes(1, TransportError::Connection("broker busy".into()));

    let outcome = client.publish("a", "1", false).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);

    client.disconnect().await;
    assert_eq!(client.stats().queue_size, 1);

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published_topics() == ["a"]).await);
    client.disconnect().await;
}
