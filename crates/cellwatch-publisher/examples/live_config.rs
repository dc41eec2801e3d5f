//! Applying settings changes to a running publisher.
//!
//! Run with: cargo run --example live_config -p cellwatch-publisher
//!
//! A new client id forces a disconnect/connect cycle; a new queue capacity
//! is applied in place.

use std::sync::Arc;
use std::time::Duration;

use cellwatch_publisher::{
    BrokerClient, ConfigWatcher, MemoryConfigSource, MemoryTransport, DEFAULT_SECTION,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("cellwatch - live configuration example\n");

    let broker = MemoryTransport::new();
    let client = BrokerClient::builder(broker.clone())
        .on_state_change(|from, to| println!("  state: {from} -> {to}"))
        .build()?;
    client.connect().await?;

    let source = Arc::new(MemoryConfigSource::new());
    let watcher = ConfigWatcher::spawn(client.clone(), Arc::clone(&source), DEFAULT_SECTION);

    println!("Shrinking the queue:");
    source.set(DEFAULT_SECTION, json!({ "queue_capacity": 50 }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("  capacity is now {}", client.stats().queue_capacity);

    println!("\nChanging the client id:");
    source.set(
        DEFAULT_SECTION,
        json!({ "client_id": "van-7-gateway", "queue_capacity": 50 }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    while watcher.reconnect_pending() || !client.is_connected() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if let Some(params) = broker.last_params() {
        println!("  reconnected as {}", params.client_id());
    }

    println!("\nAn invalid document is ignored:");
    source.set(DEFAULT_SECTION, json!({ "port": 0 }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("  still talking to {}", client.params().endpoint());

    watcher.stop().await;
    client.disconnect().await;
    Ok(())
}
