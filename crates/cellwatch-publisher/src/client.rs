//! The public client: publish path, queue flushing and subscriptions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

use crate::config::{ConnectionParams, ReconnectionConfig};
use crate::error::{ConfigError, PublishError, TransportError};
use crate::events::{ClientEvent, EventListener, EventListeners, FnListener};
use crate::lock;
use crate::manager::{ConnectionManager, SettingsChange};
use crate::payload::Payload;
use crate::queue::{MessageQueue, QueuedMessage, RetryOutcome};
use crate::state::{ConnectionState, StatsSnapshot};
use crate::supervisor::TaskSupervisor;
use crate::topic;
use crate::transport::{BrokerTransport, InboundMessage};

/// A boxed inbound message handler.
pub type MessageHandler = BoxCloneService<InboundMessage, (), BoxError>;

/// How a publish call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The transport accepted the message immediately.
    Delivered,
    /// The message was buffered for a later flush.
    Queued,
}

/// Summary of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages delivered.
    pub delivered: usize,
    /// Messages given up on.
    pub dropped: usize,
    /// The cycle stopped at a head message that will be retried.
    pub stalled: bool,
    /// Another flush was already running, so this call did nothing.
    pub skipped: bool,
}

enum DeliveryError {
    Retryable(String),
    Terminal(String),
}

/// Registered subscription handlers keyed by full topic filter.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Mutex<Vec<(String, MessageHandler)>>,
}

impl HandlerRegistry {
    pub(crate) fn insert(&self, filter: String, handler: MessageHandler) {
        let mut handlers = lock(&self.handlers);
        match handlers.iter_mut().find(|(f, _)| *f == filter) {
            Some(entry) => entry.1 = handler,
            None => handlers.push((filter, handler)),
        }
    }

    pub(crate) fn remove(&self, filter: &str) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(f, _)| f != filter);
        handlers.len() != before
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        lock(&self.handlers).iter().map(|(f, _)| f.clone()).collect()
    }

    /// Handlers whose filter matches `topic`, cloned out of the lock.
    pub(crate) fn matching(&self, topic: &str) -> Vec<(String, MessageHandler)> {
        lock(&self.handlers)
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic))
            .map(|(filter, handler)| (filter.clone(), handler.clone()))
            .collect()
    }
}

/// Shared state behind every [`BrokerClient`] clone.
pub(crate) struct Core<T: BrokerTransport> {
    pub(crate) manager: ConnectionManager<T>,
    pub(crate) queue: MessageQueue,
    pub(crate) supervisor: TaskSupervisor,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) flush_signal: Notify,
    flushing: AtomicBool,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: BrokerTransport> Core<T> {
    /// Wakes the message processor for an immediate flush.
    pub(crate) fn schedule_flush(&self) {
        self.flush_signal.notify_one();
    }

    async fn send(
        &self,
        handle: &T::Handle,
        params: &ConnectionParams,
        relative: &str,
        bytes: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        let full = topic::qualify(&params.topic_prefix, relative);
        let timeout = self.manager.config().connection_timeout;
        let publish = self
            .manager
            .transport()
            .publish(handle, &full, bytes, params.qos, retain);
        match tokio::time::timeout(timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn deliver(&self, handle: &T::Handle, message: &QueuedMessage) -> Result<(), DeliveryError> {
        let bytes = message
            .payload()
            .encode()
            .map_err(|e| DeliveryError::Terminal(format!("payload encoding failed: {e}")))?;
        let params = self.manager.params();
        self.send(handle, &params, message.topic(), &bytes, message.retain())
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    DeliveryError::Retryable(e.to_string())
                } else {
                    DeliveryError::Terminal(e.to_string())
                }
            })
    }

    pub(crate) async fn publish(
        self: &Arc<Self>,
        topic: String,
        payload: Payload,
        retain: bool,
    ) -> Result<PublishOutcome, PublishError> {
        if self.queue.is_empty() {
            if let Some(handle) = self.manager.connected_handle() {
                let bytes = payload.encode()?;
                let params = self.manager.params();
                match self.send(&handle, &params, &topic, &bytes, retain).await {
                    Ok(()) => {
                        self.manager.record_published();
                        self.manager.events().emit(&ClientEvent::MessageDelivered {
                            timestamp: Instant::now(),
                            topic,
                            from_queue: false,
                        });
                        return Ok(PublishOutcome::Delivered);
                    }
                    Err(error) => {
                        tracing::debug!(topic = %topic, error = %error, "immediate publish failed, queueing");
                        if error.is_retryable() {
                            self.session_lost(&error.to_string());
                        }
                    }
                }
            }
        }
        self.enqueue(topic, payload, retain)
    }

    fn enqueue(&self, topic: String, payload: Payload, retain: bool) -> Result<PublishOutcome, PublishError> {
        let evicted = self
            .queue
            .push(topic.clone(), payload, retain)
            .map_err(|full| PublishError::QueueFull {
                capacity: full.capacity,
            })?;

        let depth = self.queue.len();
        self.manager.record_queued(depth);
        if let Some(old) = evicted {
            self.manager.record_evicted(1);
            tracing::warn!(topic = %old.topic(), "queue full, evicted oldest message");
            self.manager.events().emit(&ClientEvent::MessageEvicted {
                timestamp: Instant::now(),
                topic: old.topic().to_string(),
            });
        }
        tracing::debug!(topic = %topic, queue_len = depth, "message queued");
        self.manager.events().emit(&ClientEvent::MessageQueued {
            timestamp: Instant::now(),
            topic,
            queue_len: depth,
        });

        if self.manager.state() == ConnectionState::Connected {
            self.schedule_flush();
        }
        Ok(PublishOutcome::Queued)
    }

    /// A connection-type delivery failure means the session is gone; the
    /// health check may not notice for a whole interval.
    fn session_lost(self: &Arc<Self>, reason: &str) {
        if self.manager.state() == ConnectionState::Connected {
            tracing::warn!(error = %reason, "delivery failed on live session");
            self.initiate_reconnection();
        }
    }

    /// Delivers queued messages in order while connected.
    pub(crate) async fn flush(self: &Arc<Self>) -> FlushReport {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        }
        let _guard = FlushGuard(&self.flushing);

        let limit = self.manager.config().message_retry_limit;
        let mut report = FlushReport::default();
        loop {
            let Some(handle) = self.manager.connected_handle() else {
                break;
            };
            let Some(message) = self.queue.front() else {
                break;
            };

            match self.deliver(&handle, &message).await {
                Ok(()) => {
                    if self.queue.complete(message.id()) {
                        self.manager.record_published();
                        report.delivered += 1;
                        self.manager.events().emit(&ClientEvent::MessageDelivered {
                            timestamp: Instant::now(),
                            topic: message.topic().to_string(),
                            from_queue: true,
                        });
                    }
                }
                Err(DeliveryError::Terminal(reason)) => {
                    if self.queue.discard(message.id()).is_some() {
                        report.dropped += 1;
                        self.dropped(&message, reason);
                    }
                }
                Err(DeliveryError::Retryable(reason)) => {
                    self.session_lost(&reason);
                    match self.queue.record_failure(message.id(), limit) {
                        RetryOutcome::Retained(retry_count) => {
                            tracing::debug!(
                                topic = %message.topic(),
                                retry_count,
                                error = %reason,
                                "queued delivery failed, will retry"
                            );
                            report.stalled = true;
                            break;
                        }
                        RetryOutcome::Dropped(dropped) => {
                            report.dropped += 1;
                            self.dropped(&dropped, format!("retry limit exceeded: {reason}"));
                        }
                        RetryOutcome::Gone => {}
                    }
                }
            }
        }

        #[cfg(feature = "metrics")]
        {
            metrics::gauge!("cellwatch_queue_depth").set(self.queue.len() as f64);
        }

        if report.delivered > 0 || report.dropped > 0 {
            tracing::debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                remaining = self.queue.len(),
                "queue flushed"
            );
        }
        report
    }

    fn dropped(&self, message: &QueuedMessage, reason: String) {
        self.manager.record_failed();
        tracing::warn!(
            topic = %message.topic(),
            retries = message.retry_count(),
            reason = %reason,
            "dropping queued message"
        );
        self.manager.events().emit(&ClientEvent::MessageDropped {
            timestamp: Instant::now(),
            topic: message.topic().to_string(),
            retries: message.retry_count(),
            reason,
        });
    }

    pub(crate) fn apply_settings(
        &self,
        params: ConnectionParams,
        config: ReconnectionConfig,
    ) -> Result<SettingsChange, ConfigError> {
        let overflow = config.overflow;
        let change = self.manager.replace_settings(params, config)?;
        self.queue.set_overflow(overflow);
        if change.capacity_changed() {
            let evicted = self.queue.resize(change.capacity);
            self.manager.record_evicted(evicted.len());
            tracing::info!(
                from = change.previous_capacity,
                to = change.capacity,
                evicted = evicted.len(),
                "queue resized"
            );
        }
        Ok(change)
    }
}

/// Resilient publishing client.
///
/// Cloning is cheap; clones share one session, queue and set of background
/// tasks. Publishing never fails because the broker is unreachable: the
/// message is queued and flushed in order once a session is available.
///
/// # Examples
///
/// ```
/// use cellwatch_publisher::{BrokerClient, ConnectionParams, MemoryTransport, PublishOutcome};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), cellwatch_publisher::PublishError> {
/// let transport = MemoryTransport::new();
/// let client = BrokerClient::builder(transport.clone())
///     .params(ConnectionParams::builder("localhost", 1883).topic_prefix("van-7").build()?)
///     .build()?;
///
/// // Not connected yet: the reading waits in the queue.
/// let outcome = client.publish("devices/bmv/reading", json!({ "voltage": 12.9 }), false).await?;
/// assert_eq!(outcome, PublishOutcome::Queued);
///
/// client.connect().await?;
/// client.flush().await;
/// assert_eq!(transport.published_topics(), ["van-7/devices/bmv/reading"]);
///
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct BrokerClient<T: BrokerTransport> {
    core: Arc<Core<T>>,
}

impl<T: BrokerTransport> Clone for BrokerClient<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: BrokerTransport> BrokerClient<T> {
    /// Starts building a client around `transport`.
    pub fn builder(transport: T) -> BrokerClientBuilder<T> {
        BrokerClientBuilder::new(transport)
    }

    /// Establishes a session, retrying with backoff.
    ///
    /// No-op when the publisher is disabled or a session exists or is being
    /// established. Returns the last attempt's error when attempts run out,
    /// leaving the client in [`ConnectionState::Failed`].
    pub async fn connect(&self) -> Result<(), PublishError> {
        self.core.connect().await
    }

    /// Stops all background work and closes the session. Idempotent.
    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    /// Publishes a message, queueing it if it cannot be delivered now.
    ///
    /// Only payload serialization errors and strict-mode
    /// [`PublishError::QueueFull`] are returned; transport failures queue the
    /// message instead. A connection or timeout failure on a live session
    /// also starts reconnection.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        retain: bool,
    ) -> Result<PublishOutcome, PublishError> {
        self.core.publish(topic.into(), payload.into(), retain).await
    }

    /// Serializes `value` to JSON and publishes it.
    pub async fn publish_serialized<S>(
        &self,
        topic: impl Into<String>,
        value: &S,
        retain: bool,
    ) -> Result<PublishOutcome, PublishError>
    where
        S: Serialize + ?Sized,
    {
        let payload = Payload::serialize(value)?;
        self.core.publish(topic.into(), payload, retain).await
    }

    /// Subscribes to a topic (relative to the namespace) and routes matching
    /// inbound messages to `handler`.
    ///
    /// The subscription is restored automatically after every reconnection.
    pub async fn subscribe<S>(&self, topic: impl AsRef<str>, handler: S) -> Result<(), PublishError>
    where
        S: Service<InboundMessage, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        let handle = self
            .core
            .manager
            .connected_handle()
            .ok_or(PublishError::NotConnected)?;
        let params = self.core.manager.params();
        let filter = topic::qualify(&params.topic_prefix, topic.as_ref());
        if !topic::is_valid_filter(&filter) {
            return Err(PublishError::Rejected(format!("invalid topic filter `{filter}`")));
        }

        let timeout = self.core.manager.config().connection_timeout;
        let request = self
            .core
            .manager
            .transport()
            .subscribe(&handle, &filter, params.qos);
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        result.map_err(|e| PublishError::from_transport(&params.endpoint(), e))?;

        tracing::info!(filter = %filter, "subscribed");
        self.core
            .handlers
            .insert(filter, BoxCloneService::new(handler.map_err(Into::<BoxError>::into)));
        Ok(())
    }

    /// Removes a subscription and its handler.
    pub async fn unsubscribe(&self, topic: impl AsRef<str>) -> Result<(), PublishError> {
        let handle = self
            .core
            .manager
            .connected_handle()
            .ok_or(PublishError::NotConnected)?;
        let params = self.core.manager.params();
        let filter = topic::qualify(&params.topic_prefix, topic.as_ref());

        let timeout = self.core.manager.config().connection_timeout;
        let request = self.core.manager.transport().unsubscribe(&handle, &filter);
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        result.map_err(|e| PublishError::from_transport(&params.endpoint(), e))?;

        self.core.handlers.remove(&filter);
        tracing::info!(filter = %filter, "unsubscribed");
        Ok(())
    }

    /// Delivers queued messages now. Returns immediately if another flush is
    /// running or the client is not connected.
    pub async fn flush(&self) -> FlushReport {
        self.core.flush().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.manager.state()
    }

    /// True while a session is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A consistent view of state, queue size and counters.
    pub fn stats(&self) -> StatsSnapshot {
        let (state, stats) = self.core.manager.snapshot();
        StatsSnapshot {
            state,
            queue_size: self.core.queue.len(),
            queue_capacity: self.core.queue.capacity(),
            stats,
        }
    }

    /// Copies of the queued messages, oldest first.
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.core.queue.snapshot()
    }

    /// Current connection parameters.
    pub fn params(&self) -> ConnectionParams {
        self.core.manager.params()
    }

    /// Current reconnection policy.
    pub fn reconnection_config(&self) -> ReconnectionConfig {
        self.core.manager.config()
    }

    /// Installs new settings. The queue is resized in place; an identity
    /// change takes effect on the next (re)connection.
    pub fn apply_settings(
        &self,
        params: ConnectionParams,
        config: ReconnectionConfig,
    ) -> Result<SettingsChange, PublishError> {
        Ok(self.core.apply_settings(params, config)?)
    }

    /// Background tasks currently tracked by the supervisor.
    pub fn active_tasks(&self) -> usize {
        self.core.supervisor.active()
    }

    /// Cycles the session on a supervised task so new identity settings
    /// take effect. `disconnect()` cancels it.
    pub(crate) fn schedule_session_cycle(&self) -> Option<AbortHandle> {
        self.core.schedule_cycle()
    }
}

impl<T: BrokerTransport> std::fmt::Debug for BrokerClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("state", &self.state())
            .field("queue", &self.core.queue)
            .finish_non_exhaustive()
    }
}

/// Builder for [`BrokerClient`].
pub struct BrokerClientBuilder<T: BrokerTransport> {
    transport: T,
    params: Option<ConnectionParams>,
    config: ReconnectionConfig,
    listeners: EventListeners,
}

impl<T: BrokerTransport> BrokerClientBuilder<T> {
    fn new(transport: T) -> Self {
        crate::describe_metrics();
        Self {
            transport,
            params: None,
            config: ReconnectionConfig::default(),
            listeners: EventListeners::new(),
        }
    }

    /// Sets connection parameters. Default: `localhost:1883`.
    pub fn params(mut self, params: ConnectionParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets the reconnection policy.
    pub fn reconnection(mut self, config: ReconnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an event listener.
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: EventListener + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Registers a callback for state transitions.
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event: &ClientEvent| {
            if let ClientEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Validates the configuration and builds the client. Does not connect.
    pub fn build(self) -> Result<BrokerClient<T>, PublishError> {
        let params = match self.params {
            Some(params) => params,
            None => ConnectionParams::builder("localhost", 1883).build()?,
        };
        let queue = MessageQueue::new(self.config.queue_capacity, self.config.overflow);
        let manager = ConnectionManager::new(self.transport, params, self.config, self.listeners)?;

        Ok(BrokerClient {
            core: Arc::new(Core {
                manager,
                queue,
                supervisor: TaskSupervisor::new(),
                handlers: HandlerRegistry::default(),
                flush_signal: Notify::new(),
                flushing: AtomicBool::new(false),
            }),
        })
    }
}

impl<T: BrokerTransport> std::fmt::Debug for BrokerClientBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClientBuilder")
            .field("params", &self.params)
            .field("config", &self.config)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}
