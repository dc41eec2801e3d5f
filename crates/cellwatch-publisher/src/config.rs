//! Connection parameters, reconnection policy, and live settings documents.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use cellwatch_backoff::RetryScheduler;
use serde::Deserialize;

use crate::error::ConfigError;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, possibly duplicated.
    AtLeastOnce,
    /// Acknowledged delivery without duplicates.
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Username/password pair presented to the broker.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    /// Broker username.
    pub username: String,
    /// Broker password.
    pub password: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS material for the broker session. The transport decides how to load it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// CA bundle used to verify the broker.
    pub ca_file: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// Private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Skip broker certificate verification.
    pub insecure_skip_verify: bool,
}

/// Everything needed to open a broker session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub(crate) enabled: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) client_id: String,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) topic_prefix: String,
    pub(crate) qos: QoS,
    pub(crate) keep_alive: Duration,
    pub(crate) announce_status: bool,
}

impl ConnectionParams {
    /// Creates a new builder for the broker at `host:port`.
    pub fn builder(host: impl Into<String>, port: u16) -> ConnectionParamsBuilder {
        ConnectionParamsBuilder::new(host, port)
    }

    /// Whether the publisher should connect at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Broker host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Optional username/password.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Optional TLS material.
    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Namespace prepended to every relative topic. May be empty.
    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// QoS used for publishes and subscriptions.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Keep-alive interval requested from the broker.
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Whether retained `online`/`offline` status messages are published.
    pub fn announce_status(&self) -> bool {
        self.announce_status
    }

    /// Human-readable endpoint used in errors and logs.
    pub fn endpoint(&self) -> String {
        let scheme = if self.tls.is_some() { "mqtts" } else { "mqtt" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// True if switching from `self` to `other` requires a new session.
    ///
    /// Identity covers endpoint, credentials, TLS, topic namespace and client
    /// id. QoS, keep-alive and the enabled flag are not part of it.
    pub fn identity_differs(&self, other: &ConnectionParams) -> bool {
        self.host != other.host
            || self.port != other.port
            || self.client_id != other.client_id
            || self.credentials != other.credentials
            || self.tls != other.tls
            || self.topic_prefix != other.topic_prefix
    }

    /// Checks that the parameters can describe a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        Ok(())
    }
}

/// Builder for [`ConnectionParams`].
#[derive(Debug, Clone)]
pub struct ConnectionParamsBuilder {
    params: ConnectionParams,
}

impl ConnectionParamsBuilder {
    fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            params: ConnectionParams {
                enabled: true,
                host: host.into(),
                port,
                client_id: "cellwatch".to_string(),
                credentials: None,
                tls: None,
                topic_prefix: String::new(),
                qos: QoS::AtLeastOnce,
                keep_alive: Duration::from_secs(60),
                announce_status: false,
            },
        }
    }

    /// Enables or disables the publisher. A disabled publisher never connects.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.params.enabled = enabled;
        self
    }

    /// Sets the client identifier. Default: `cellwatch`.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.params.client_id = client_id.into();
        self
    }

    /// Sets username/password authentication.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.params.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Enables TLS with the given material.
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.params.tls = Some(tls);
        self
    }

    /// Sets the topic namespace. Default: empty.
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.params.topic_prefix = prefix.into();
        self
    }

    /// Sets the QoS level. Default: at least once.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.params.qos = qos;
        self
    }

    /// Sets the keep-alive interval. Default: 60 seconds.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.params.keep_alive = keep_alive;
        self
    }

    /// Enables retained `online`/`offline` status messages. Default: off.
    pub fn announce_status(mut self, announce: bool) -> Self {
        self.params.announce_status = announce;
        self
    }

    /// Validates and builds the parameters.
    pub fn build(self) -> Result<ConnectionParams, ConfigError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

/// What happens when a message arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Refuse the new message with [`PublishError::QueueFull`](crate::PublishError::QueueFull).
    Reject,
}

/// Retry, health and queue policy for the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionConfig {
    pub(crate) max_retries: u32,
    pub(crate) initial_retry_delay: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) backoff_multiplier: f64,
    pub(crate) jitter_factor: f64,
    pub(crate) connection_timeout: Duration,
    pub(crate) health_check_interval: Duration,
    pub(crate) flush_interval: Duration,
    pub(crate) queue_capacity: usize,
    pub(crate) message_retry_limit: u32,
    pub(crate) overflow: OverflowPolicy,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            connection_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(5),
            queue_capacity: 1000,
            message_retry_limit: 3,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl ReconnectionConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> ReconnectionConfigBuilder {
        ReconnectionConfigBuilder::default()
    }

    /// Connection attempts per connect or reconnect sequence. Zero means one.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Attempts actually made per sequence.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Base delay before the second attempt.
    pub fn initial_retry_delay(&self) -> Duration {
        self.initial_retry_delay
    }

    /// Upper bound on the un-jittered delay.
    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    /// Growth factor per attempt.
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Fraction of the capped delay added as uniform jitter.
    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Deadline for each connect attempt and transport operation.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Period of the health-check loop.
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Period of the message-processor loop.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Maximum number of queued messages.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Failed deliveries tolerated before a queued message is dropped.
    pub fn message_retry_limit(&self) -> u32 {
        self.message_retry_limit
    }

    /// Behaviour of a full queue.
    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Builds the retry scheduler described by this policy.
    pub fn scheduler(&self) -> Result<RetryScheduler, ConfigError> {
        Ok(RetryScheduler::exponential(
            self.initial_retry_delay,
            self.max_retry_delay,
            self.backoff_multiplier,
            self.jitter_factor,
        )?)
    }

    /// Checks queue bounds and the retry policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("health_check_interval"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("flush_interval"));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("connection_timeout"));
        }
        self.scheduler().map(|_| ())
    }
}

/// Builder for [`ReconnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReconnectionConfigBuilder {
    config: ReconnectionConfig,
}

impl ReconnectionConfigBuilder {
    /// Sets connection attempts per sequence. Default: 10.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Sets the base retry delay. Default: 1 second.
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.config.initial_retry_delay = delay;
        self
    }

    /// Sets the cap on the un-jittered delay. Default: 60 seconds.
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    /// Sets the growth factor. Default: 2.0.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction. Default: 0.1.
    pub fn jitter_factor(mut self, jitter: f64) -> Self {
        self.config.jitter_factor = jitter;
        self
    }

    /// Sets the per-attempt deadline. Default: 10 seconds.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Sets the health-check period. Default: 30 seconds.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Sets the queue flush period. Default: 5 seconds.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Sets the queue capacity. Default: 1000.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the per-message retry limit. Default: 3.
    pub fn message_retry_limit(mut self, limit: u32) -> Self {
        self.config.message_retry_limit = limit;
        self
    }

    /// Sets the overflow behaviour. Default: [`OverflowPolicy::DropOldest`].
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.config.overflow = overflow;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<ReconnectionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// The publisher's section of an external settings document.
///
/// Durations are expressed in milliseconds. Missing keys take the same
/// defaults as the builders.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsSettings>,
    pub topic_prefix: String,
    pub qos: QoS,
    pub keep_alive_ms: u64,
    pub announce_status: bool,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub connection_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
    pub message_retry_limit: u32,
    pub overflow: OverflowPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let config = ReconnectionConfig::default();
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "cellwatch".to_string(),
            username: None,
            password: None,
            tls: None,
            topic_prefix: String::new(),
            qos: QoS::AtLeastOnce,
            keep_alive_ms: 60_000,
            announce_status: false,
            max_retries: config.max_retries,
            initial_retry_delay_ms: millis(config.initial_retry_delay),
            max_retry_delay_ms: millis(config.max_retry_delay),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            connection_timeout_ms: millis(config.connection_timeout),
            health_check_interval_ms: millis(config.health_check_interval),
            flush_interval_ms: millis(config.flush_interval),
            queue_capacity: config.queue_capacity,
            message_retry_limit: config.message_retry_limit,
            overflow: config.overflow,
        }
    }
}

impl BrokerSettings {
    /// Decodes a settings section.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(ConfigError::Settings)
    }

    /// Splits the document into validated connection parameters and policy.
    ///
    /// A username without a password is accepted and sent with an empty
    /// password.
    pub fn into_parts(self) -> Result<(ConnectionParams, ReconnectionConfig), ConfigError> {
        let credentials = self
            .username
            .map(|username| Credentials::new(username, self.password.unwrap_or_default()));

        let params = ConnectionParams {
            enabled: self.enabled,
            host: self.host,
            port: self.port,
            client_id: self.client_id,
            credentials,
            tls: self.tls,
            topic_prefix: self.topic_prefix,
            qos: self.qos,
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            announce_status: self.announce_status,
        };
        params.validate()?;

        let config = ReconnectionConfig {
            max_retries: self.max_retries,
            initial_retry_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            queue_capacity: self.queue_capacity,
            message_retry_limit: self.message_retry_limit,
            overflow: self.overflow,
        };
        config.validate()?;

        Ok((params, config))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
