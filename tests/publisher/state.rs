use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellwatch_publisher::{BrokerClient, ConnectionState, MemoryTransport, TransportError};

use super::{config, eventually, params};

type Transitions = Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>>;

fn recording_client(
    transport: &MemoryTransport,
    max_retries: u32,
) -> (BrokerClient<MemoryTransport>, Transitions) {
    let transitions: Transitions = Arc::new(Mutex::new(Vec::new()));
    let client = BrokerClient::builder(transport.clone())
        .params(params().build().unwrap())
        .reconnection(
            config()
                .max_retries(max_retries)
                .health_check_interval(Duration::from_secs(1))
                .build()
                .unwrap(),
        )
        .on_state_change({
            let transitions = Arc::clone(&transitions);
            move |from, to| transitions.lock().unwrap().push((from, to))
        })
        .build()
        .unwrap();
    (client, transitions)
}

#[tokio::test(start_paused = true)]
async fn connect_and_disconnect_transitions() {
    use ConnectionState::*;

    let transport = MemoryTransport::new();
    let (client, transitions) = recording_client(&transport, 3);
    assert_eq!(client.state(), Disconnected);

    client.connect().await.unwrap();
    client.disconnect().await;

    assert_eq!(
        *transitions.lock().unwrap(),
        [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Disconnected),
        ]
    );
    let stats = client.stats().stats;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.total_disconnections, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let transport = MemoryTransport::new();
    let (client, transitions) = recording_client(&transport, 3);

    client.disconnect().await;
    client.connect().await.unwrap();
    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(transitions.lock().unwrap().len(), 3);
    assert_eq!(client.stats().stats.total_disconnections, 1);
    assert_eq!(transport.closed_sessions(), 1);
    assert_eq!(client.active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_is_a_no_op() {
    let transport = MemoryTransport::new();
    let (client, _) = recording_client(&transport, 3);

    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(client.stats().stats.total_connections, 1);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn session_loss_walks_the_reconnect_path() {
    use ConnectionState::*;

    let transport = MemoryTransport::new();
    let (client, transitions) = recording_client(&transport, 3);
    client.connect().await.unwrap();

    transport.fail_connects(1, TransportError::Connection("refused".into()));
    transport.drop_connections();
    assert!(eventually(|| client.stats().stats.total_reconnections == 1 && client.is_connected()).await);

    let transitions = transitions.lock().unwrap().clone();
    assert_eq!(
        transitions,
        [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Reconnecting),
            (Reconnecting, Connected),
        ]
    );
    assert!(transitions.iter().all(|(from, to)| from.can_transition_to(*to)));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn failed_client_can_connect_again() {
    use ConnectionState::*;

    let transport = MemoryTransport::new();
    transport.fail_connects(2, TransportError::Connection("refused".into()));
    let (client, transitions) = recording_client(&transport, 2);

    assert!(client.connect().await.is_err());
    assert_eq!(client.state(), Failed);
    client.connect().await.unwrap();

    assert_eq!(
        *transitions.lock().unwrap(),
        [
            (Disconnected, Connecting),
            (Connecting, Failed),
            (Failed, Connecting),
            (Connecting, Connected),
        ]
    );
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_stops_retrying() {
    let transport = MemoryTransport::new();
    let (client, _) = recording_client(&transport, 10);
    client.connect().await.unwrap();

    transport.fail_connects(10, TransportError::Connection("refused".into()));
    transport.drop_connections();
    assert!(eventually(|| client.state() == ConnectionState::Reconnecting).await);

    client.disconnect().await;
    let attempts = transport.connect_attempts();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connect_attempts(), attempts);
    assert_eq!(client.active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn snapshot_reports_queue_and_state_together() {
    let transport = MemoryTransport::new();
    let (client, _) = recording_client(&transport, 3);
    client.publish("a", "1", false).await.unwrap();

    let snapshot = client.stats();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.queue_size, 1);
    assert_eq!(snapshot.queue_capacity, 1000);
    assert_eq!(snapshot.stats.messages_queued, 1);
}
