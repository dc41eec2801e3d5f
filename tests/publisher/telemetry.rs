use cellwatch_publisher::{
    BatteryReading, BatterySummary, DeviceStatus, MemoryTransport, PublishOutcome,
    TelemetryPublisher,
};
use chrono::{TimeZone, Utc};

use super::{client, config, eventually, params};

fn reading(device_id: &str, secs: i64) -> BatteryReading {
    BatteryReading {
        device_id: device_id.into(),
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        voltage: 13.1,
        current: 2.5,
        state_of_charge: Some(88.0),
        temperature: Some(21.0),
    }
}

#[tokio::test(start_paused = true)]
async fn readings_are_published_under_the_device_namespace() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params().topic_prefix("fleet/van-7"), config());
    client.connect().await.unwrap();
    let telemetry = TelemetryPublisher::new(client.clone());

    let outcome = telemetry.publish_reading(&reading("bmv-712", 0)).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Delivered);
    let published = transport.published();
    assert_eq!(published[0].topic, "fleet/van-7/devices/bmv-712/reading");
    assert!(!published[0].retain);
    let decoded: BatteryReading = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(decoded, reading("bmv-712", 0));

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn status_is_retained() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    client.connect().await.unwrap();
    let telemetry = TelemetryPublisher::new(client.clone());

    let status = DeviceStatus {
        device_id: "AA:BB:CC:DD".into(),
        online: true,
        rssi: Some(-67),
        last_seen: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    };
    telemetry.publish_status(&status).await.unwrap();

    let published = transport.published();
    assert_eq!(published[0].topic, "devices/AA:BB:CC:DD/status");
    assert!(published[0].retain);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn readings_taken_offline_arrive_after_reconnect() {
    let transport = MemoryTransport::new();
    let client = client(&transport, params(), config());
    let telemetry = TelemetryPublisher::new(client.clone());

    let readings: Vec<BatteryReading> = (0..3).map(|i| reading("shunt", i * 60)).collect();
    for r in &readings {
        let outcome = telemetry.publish_reading(r).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
    }
    let summary = BatterySummary::from_readings("shunt", &readings).unwrap();
    telemetry.publish_summary(&summary).await.unwrap();

    client.connect().await.unwrap();
    assert!(eventually(|| transport.published().len() == 4).await);

    assert_eq!(
        transport.published_topics(),
        [
            "devices/shunt/reading",
            "devices/shunt/reading",
            "devices/shunt/reading",
            "devices/shunt/summary",
        ]
    );
    let decoded: BatterySummary =
        serde_json::from_slice(&transport.published()[3].payload).unwrap();
    assert_eq!(decoded.samples, 3);
    // 32.75 W for two minutes.
    assert!((decoded.energy_wh - 32.75 / 30.0).abs() < 1e-9);

    client.disconnect().await;
}
