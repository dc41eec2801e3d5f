//! A gateway publishing battery monitor readings through a broker outage.
//!
//! Run with: cargo run --example battery_gateway -p cellwatch-publisher
//!
//! Readings taken while the broker is unreachable are queued and delivered
//! in order once the session is restored.

use std::time::Duration;

use cellwatch_publisher::{
    BatteryReading, BatterySummary, BrokerClient, ClientEvent, ConnectionParams, FnListener,
    MemoryTransport, ReconnectionConfig, TelemetryPublisher, TransportError,
};

fn reading(step: u32) -> BatteryReading {
    BatteryReading {
        device_id: "bmv-712".into(),
        timestamp: chrono::Utc::now(),
        voltage: 13.2 - f64::from(step) * 0.02,
        current: -4.5,
        state_of_charge: Some(95.0 - f64::from(step) * 0.5),
        temperature: Some(19.5),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("cellwatch - battery gateway example\n");

    let broker = MemoryTransport::new();
    let client = BrokerClient::builder(broker.clone())
        .params(
            ConnectionParams::builder("broker.local", 1883)
                .client_id("van-7-gateway")
                .topic_prefix("fleet/van-7")
                .build()?,
        )
        .reconnection(
            ReconnectionConfig::builder()
                .max_retries(5)
                .initial_retry_delay(Duration::from_millis(200))
                .max_retry_delay(Duration::from_secs(2))
                .health_check_interval(Duration::from_millis(250))
                .flush_interval(Duration::from_millis(500))
                .queue_capacity(100)
                .build()?,
        )
        .on_state_change(|from, to| println!("  state: {from} -> {to}"))
        .on_event(FnListener::new(|event: &ClientEvent| {
            if let ClientEvent::ConnectAttemptFailed { attempt, retry_in, .. } = event {
                println!("  attempt {attempt} failed, retrying in {retry_in:?}");
            }
        }))
        .build()?;

    client.connect().await?;
    let telemetry = TelemetryPublisher::new(client.clone());
    let mut history = Vec::new();

    println!("Publishing while connected:");
    for step in 0..3 {
        let r = reading(step);
        println!("  {:?}", telemetry.publish_reading(&r).await?);
        history.push(r);
    }

    println!("\nBroker goes away for a while:");
    broker.fail_connects(2, TransportError::Connection("connection refused".into()));
    broker.drop_connections();
    for step in 3..6 {
        let r = reading(step);
        println!("  {:?}", telemetry.publish_reading(&r).await?);
        history.push(r);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    while !client.is_connected() || client.stats().queue_size > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let Some(summary) = BatterySummary::from_readings("bmv-712", &history) {
        telemetry.publish_summary(&summary).await?;
    }

    let stats = client.stats();
    println!("\nFinal statistics:");
    println!("  state: {}", stats.state);
    println!("  published: {}", stats.stats.messages_published);
    println!("  queued: {}", stats.stats.messages_queued);
    println!("  reconnections: {}", stats.stats.total_reconnections);

    println!("\nTopics seen by the broker:");
    for message in broker.published() {
        println!("  {} (retain: {})", message.topic, message.retain);
    }

    client.disconnect().await;
    Ok(())
}
