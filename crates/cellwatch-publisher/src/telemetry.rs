//! Battery monitor telemetry documents and their topics.
//!
//! Readings, status and summaries are published as JSON under
//! `devices/{device_id}/...`, relative to the client's namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{BrokerClient, PublishOutcome};
use crate::error::PublishError;
use crate::transport::BrokerTransport;

/// One measurement from a battery monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub device_id: String,
    /// RFC 3339 timestamp of the measurement.
    pub timestamp: DateTime<Utc>,
    /// Pack voltage in volts.
    pub voltage: f64,
    /// Current in amperes; positive while charging.
    pub current: f64,
    /// State of charge in percent, when the monitor reports it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state_of_charge: Option<f64>,
    /// Temperature in degrees Celsius.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f64>,
}

impl BatteryReading {
    /// Power in watts.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// Connectivity of a monitor as seen by the gateway. Published retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    /// Received signal strength in dBm.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i16>,
    pub last_seen: DateTime<Utc>,
}

/// Aggregate over a window of readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySummary {
    pub device_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub samples: usize,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub avg_voltage: f64,
    pub avg_current: f64,
    /// Net energy over the window in watt-hours; negative while discharging.
    pub energy_wh: f64,
}

impl BatterySummary {
    /// Summarises readings for one device. Returns `None` for an empty slice.
    ///
    /// Readings are sorted by timestamp before integrating power with the
    /// trapezoidal rule.
    pub fn from_readings(device_id: impl Into<String>, readings: &[BatteryReading]) -> Option<Self> {
        let mut sorted: Vec<&BatteryReading> = readings.iter().collect();
        sorted.sort_by_key(|r| r.timestamp);
        let first = sorted.first()?;
        let last = sorted.last()?;

        let count = sorted.len() as f64;
        let min_voltage = sorted.iter().map(|r| r.voltage).fold(f64::INFINITY, f64::min);
        let max_voltage = sorted.iter().map(|r| r.voltage).fold(f64::NEG_INFINITY, f64::max);
        let avg_voltage = sorted.iter().map(|r| r.voltage).sum::<f64>() / count;
        let avg_current = sorted.iter().map(|r| r.current).sum::<f64>() / count;

        let energy_wh = sorted
            .windows(2)
            .map(|pair| {
                let hours = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64 / 3_600_000.0;
                (pair[0].power() + pair[1].power()) / 2.0 * hours
            })
            .sum();

        Some(Self {
            device_id: device_id.into(),
            period_start: first.timestamp,
            period_end: last.timestamp,
            samples: sorted.len(),
            min_voltage,
            max_voltage,
            avg_voltage,
            avg_current,
            energy_wh,
        })
    }
}

/// Topic for `leaf` under a device. Characters that would be read as topic
/// separators or wildcards are replaced with `_`.
pub fn device_topic(device_id: &str, leaf: &str) -> String {
    let id: String = device_id
        .chars()
        .map(|c| if matches!(c, '/' | '+' | '#') { '_' } else { c })
        .collect();
    format!("devices/{id}/{leaf}")
}

/// Publishes telemetry documents through a [`BrokerClient`].
pub struct TelemetryPublisher<T: BrokerTransport> {
    client: BrokerClient<T>,
}

impl<T: BrokerTransport> TelemetryPublisher<T> {
    /// Wraps a client.
    pub fn new(client: BrokerClient<T>) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &BrokerClient<T> {
        &self.client
    }

    /// Publishes to `devices/{id}/reading`.
    pub async fn publish_reading(&self, reading: &BatteryReading) -> Result<PublishOutcome, PublishError> {
        let topic = device_topic(&reading.device_id, "reading");
        self.client.publish_serialized(topic, reading, false).await
    }

    /// Publishes to `devices/{id}/status`, retained.
    pub async fn publish_status(&self, status: &DeviceStatus) -> Result<PublishOutcome, PublishError> {
        let topic = device_topic(&status.device_id, "status");
        self.client.publish_serialized(topic, status, true).await
    }

    /// Publishes to `devices/{id}/summary`.
    pub async fn publish_summary(&self, summary: &BatterySummary) -> Result<PublishOutcome, PublishError> {
        let topic = device_topic(&summary.device_id, "summary");
        self.client.publish_serialized(topic, summary, false).await
    }
}

impl<T: BrokerTransport> Clone for TelemetryPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}
