use std::sync::Arc;
use std::time::Duration;

use cellwatch_publisher::{
    ConfigWatcher, ConnectionState, MemoryConfigSource, MemoryTransport, DEFAULT_SECTION,
};
use serde_json::json;

use super::{client, config, eventually, params};

#[tokio::test(start_paused = true)]
async fn capacity_change_resizes_queue() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config().queue_capacity(5));
    for topic in ["a", "b", "c", "d"] {
        client.publish(topic, "x", false).await.unwrap();
    }

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(
        DEFAULT_SECTION,
        json!({ "host": "memory", "announce_status": false, "queue_capacity": 2 }),
    );

    assert!(eventually(|| client.stats().queue_capacity == 2).await);
    let remaining: Vec<String> = client
        .queued_messages()
        .iter()
        .map(|m| m.topic().to_string())
        .collect();
    assert_eq!(remaining, ["c", "d"]);
    assert_eq!(client.stats().stats.messages_evicted, 2);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn identity_change_reconnects_with_new_parameters() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(
        DEFAULT_SECTION,
        json!({ "host": "memory", "client_id": "van-42", "announce_status": false }),
    );

    assert!(
        eventually(|| {
            transport.connect_attempts() == 2 && client.is_connected() && !watcher.reconnect_pending()
        })
        .await
    );
    assert_eq!(transport.last_params().unwrap().client_id(), "van-42");
    assert_eq!(client.params().client_id(), "van-42");
    assert_eq!(transport.closed_sessions(), 1);

    watcher.stop().await;
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn non_identity_change_keeps_the_session() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(
        DEFAULT_SECTION,
        json!({ "host": "memory", "announce_status": false, "qos": 2, "queue_capacity": 10 }),
    );

    assert!(eventually(|| client.stats().queue_capacity == 10).await);
    assert_eq!(transport.connect_attempts(), 1);
    assert!(client.is_connected());
    assert!(!watcher.reconnect_pending());

    watcher.stop().await;
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_documents_are_ignored() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config().queue_capacity(5));

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(DEFAULT_SECTION, json!({ "host": "memory", "queue_capacity": 0 }));
    source.set(DEFAULT_SECTION, json!({ "host": "memory", "qos": 9 }));
    source.set("logging", json!({ "level": "debug" }));
    source.set(
        DEFAULT_SECTION,
        json!({ "host": "memory", "announce_status": false, "queue_capacity": 7 }),
    );

    assert!(eventually(|| client.stats().queue_capacity == 7).await);
    assert_eq!(client.params().host(), "memory");

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_while_connected_tears_the_session_down() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(
        DEFAULT_SECTION,
        json!({ "enabled": false, "host": "memory", "announce_status": false }),
    );

    assert!(
        eventually(|| client.state() == ConnectionState::Disconnected && !watcher.reconnect_pending())
            .await
    );
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(transport.open_sessions(), 0);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_cancels_a_settings_reconnect() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();
    transport.set_connect_delay(Some(Duration::from_secs(1)));

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);
    source.set(
        DEFAULT_SECTION,
        json!({ "host": "memory", "client_id": "van-42", "announce_status": false }),
    );

    assert!(eventually(|| client.state() == ConnectionState::Connecting).await);
    assert!(watcher.reconnect_pending());
    // The cycle is the only tracked task while the new session is pending.
    assert_eq!(client.active_tasks(), 1);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.active_tasks(), 0);
    assert!(!watcher.reconnect_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.open_sessions(), 0);

    watcher.stop().await;
}
