//! Connection lifecycle: the state machine, its counters, and the attempt loop.
//!
//! `ConnectionManager` is the only writer of `ConnectionState` and
//! `ConnectionStats`. Both live behind one mutex so a snapshot never sees a
//! state that disagrees with its counters. Listeners are notified after the
//! mutex is released.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use cellwatch_backoff::RetryScheduler;
#[cfg(feature = "metrics")]
use metrics::{counter, gauge};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Core;
use crate::config::{ConnectionParams, ReconnectionConfig};
use crate::error::{ConfigError, PublishError};
use crate::events::{ClientEvent, EventListeners};
use crate::state::{ConnectionState, ConnectionStats};
use crate::topic;
use crate::transport::BrokerTransport;
use crate::{lock, read, write};

/// Topic used for the retained `online`/`offline` announcement.
pub const STATUS_TOPIC: &str = "status";

#[derive(Debug, Clone)]
struct Settings {
    params: ConnectionParams,
    config: ReconnectionConfig,
    scheduler: RetryScheduler,
}

struct Shared {
    state: ConnectionState,
    stats: ConnectionStats,
}

/// What changed when new settings were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsChange {
    /// Endpoint, credentials, TLS, namespace or client id changed.
    pub identity_changed: bool,
    /// The publisher was switched on or off.
    pub enabled_changed: bool,
    /// Queue capacity before the change.
    pub previous_capacity: usize,
    /// Queue capacity after the change.
    pub capacity: usize,
}

impl SettingsChange {
    /// True if the queue must be resized.
    pub fn capacity_changed(&self) -> bool {
        self.previous_capacity != self.capacity
    }
}

pub(crate) struct ConnectionManager<T: BrokerTransport> {
    transport: T,
    settings: RwLock<Settings>,
    shared: Mutex<Shared>,
    // Lock order: `shared` before `handle`.
    handle: Mutex<Option<Arc<T::Handle>>>,
    shutdown: Mutex<CancellationToken>,
    events: EventListeners,
}

impl<T: BrokerTransport> ConnectionManager<T> {
    pub(crate) fn new(
        transport: T,
        params: ConnectionParams,
        config: ReconnectionConfig,
        events: EventListeners,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        config.validate()?;
        let scheduler = config.scheduler()?;
        Ok(Self {
            transport,
            settings: RwLock::new(Settings {
                params,
                config,
                scheduler,
            }),
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                stats: ConnectionStats::default(),
            }),
            handle: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            events,
        })
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn events(&self) -> &EventListeners {
        &self.events
    }

    pub(crate) fn params(&self) -> ConnectionParams {
        read(&self.settings).params.clone()
    }

    pub(crate) fn config(&self) -> ReconnectionConfig {
        read(&self.settings).config.clone()
    }

    /// Validates and installs new settings.
    pub(crate) fn replace_settings(
        &self,
        params: ConnectionParams,
        config: ReconnectionConfig,
    ) -> Result<SettingsChange, ConfigError> {
        params.validate()?;
        config.validate()?;
        let scheduler = config.scheduler()?;

        let mut settings = write(&self.settings);
        let change = SettingsChange {
            identity_changed: settings.params.identity_differs(&params),
            enabled_changed: settings.params.enabled != params.enabled,
            previous_capacity: settings.config.queue_capacity,
            capacity: config.queue_capacity,
        };
        *settings = Settings {
            params,
            config,
            scheduler,
        };
        Ok(change)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    /// State and counters read under the same lock.
    pub(crate) fn snapshot(&self) -> (ConnectionState, ConnectionStats) {
        let shared = lock(&self.shared);
        (shared.state, shared.stats.clone())
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    /// Installs a fresh shutdown signal so later `connect()` calls work.
    pub(crate) fn reset_shutdown(&self) {
        *lock(&self.shutdown) = CancellationToken::new();
    }

    /// The session handle, only while `Connected`.
    pub(crate) fn connected_handle(&self) -> Option<Arc<T::Handle>> {
        let shared = lock(&self.shared);
        if shared.state != ConnectionState::Connected {
            return None;
        }
        lock(&self.handle).clone()
    }

    pub(crate) fn take_handle(&self) -> Option<Arc<T::Handle>> {
        lock(&self.handle).take()
    }

    /// `Disconnected | Failed -> Connecting`. False if another attempt owns
    /// the session or one is already established.
    pub(crate) fn begin_connect(&self) -> bool {
        self.transition_if(
            |state| matches!(state, ConnectionState::Disconnected | ConnectionState::Failed),
            ConnectionState::Connecting,
            |_| {},
        )
    }

    /// `Connected -> Reconnecting`, counting the reconnection.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.transition_if(
            |state| state == ConnectionState::Connected,
            ConnectionState::Reconnecting,
            |stats| stats.total_reconnections += 1,
        )
    }

    /// Moves `expected -> Connected` and stores the handle. Hands the handle
    /// back if the state moved on in the meantime (e.g. `disconnect()`).
    pub(crate) fn complete(
        &self,
        expected: ConnectionState,
        handle: T::Handle,
    ) -> Result<(), T::Handle> {
        let transition = {
            let mut shared = lock(&self.shared);
            if shared.state != expected {
                return Err(handle);
            }
            *lock(&self.handle) = Some(Arc::new(handle));
            shared.stats.total_connections += 1;
            shared.stats.consecutive_failures = 0;
            self.apply(&mut shared, ConnectionState::Connected)
        };
        self.announce(transition);
        Ok(())
    }

    /// `expected -> Failed`, if still in `expected`.
    pub(crate) fn fail(&self, expected: ConnectionState) -> bool {
        self.transition_if(|state| state == expected, ConnectionState::Failed, |_| {})
    }

    /// Moves to `Disconnected` from anywhere and takes the handle.
    pub(crate) fn mark_disconnected(&self) -> Option<Arc<T::Handle>> {
        let (transition, handle) = {
            let mut shared = lock(&self.shared);
            if shared.state != ConnectionState::Disconnected {
                shared.stats.total_disconnections += 1;
            }
            let transition = self.apply(&mut shared, ConnectionState::Disconnected);
            (transition, lock(&self.handle).take())
        };
        self.announce(transition);
        handle
    }

    fn transition_if(
        &self,
        guard: impl FnOnce(ConnectionState) -> bool,
        to: ConnectionState,
        update: impl FnOnce(&mut ConnectionStats),
    ) -> bool {
        let transition = {
            let mut shared = lock(&self.shared);
            if !guard(shared.state) {
                return false;
            }
            if !shared.state.can_transition_to(to) {
                tracing::warn!(from = %shared.state, to = %to, "rejected illegal state transition");
                return false;
            }
            update(&mut shared.stats);
            self.apply(&mut shared, to)
        };
        self.announce(transition);
        true
    }

    /// Sets the state while the caller holds the lock. Returns the transition
    /// to announce once the lock is released.
    fn apply(&self, shared: &mut Shared, to: ConnectionState) -> Option<(ConnectionState, ConnectionState)> {
        let from = shared.state;
        if from == to {
            return None;
        }
        shared.state = to;
        Some((from, to))
    }

    fn announce(&self, transition: Option<(ConnectionState, ConnectionState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        tracing::info!(from = %from, to = %to, "connection state transition");

        #[cfg(feature = "metrics")]
        {
            counter!(
                "cellwatch_state_transitions_total",
                "from" => from.as_str(),
                "to" => to.as_str()
            )
            .increment(1);
        }

        self.events.emit(&ClientEvent::StateTransition {
            timestamp: Instant::now(),
            from,
            to,
        });
    }

    fn record_attempt(&self) {
        lock(&self.shared).stats.last_attempt = Some(SystemTime::now());
    }

    fn record_attempt_failure(&self) -> u32 {
        let mut shared = lock(&self.shared);
        shared.stats.consecutive_failures = shared.stats.consecutive_failures.saturating_add(1);
        shared.stats.consecutive_failures
    }

    pub(crate) fn record_published(&self) {
        lock(&self.shared).stats.messages_published += 1;
        #[cfg(feature = "metrics")]
        {
            counter!("cellwatch_messages_published_total").increment(1);
        }
    }

    pub(crate) fn record_queued(&self, depth: usize) {
        lock(&self.shared).stats.messages_queued += 1;
        #[cfg(feature = "metrics")]
        {
            counter!("cellwatch_messages_queued_total").increment(1);
            gauge!("cellwatch_queue_depth").set(depth as f64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = depth;
    }

    pub(crate) fn record_evicted(&self, count: usize) {
        if count == 0 {
            return;
        }
        lock(&self.shared).stats.messages_evicted += count as u64;
        #[cfg(feature = "metrics")]
        {
            counter!("cellwatch_messages_evicted_total").increment(count as u64);
        }
    }

    pub(crate) fn record_failed(&self) {
        lock(&self.shared).stats.messages_failed += 1;
        #[cfg(feature = "metrics")]
        {
            counter!("cellwatch_messages_failed_total").increment(1);
        }
    }

    /// Runs up to `max(max_retries, 1)` connect attempts, each bounded by the
    /// connection timeout, sleeping the scheduler's delay between them.
    ///
    /// Returns [`PublishError::Shutdown`] as soon as `token` is cancelled;
    /// otherwise the last attempt's error once attempts are exhausted.
    pub(crate) async fn attempt_loop(
        &self,
        token: &CancellationToken,
    ) -> Result<T::Handle, PublishError> {
        let (params, attempts, timeout, scheduler) = {
            let settings = read(&self.settings);
            (
                settings.params.clone(),
                settings.config.attempts(),
                settings.config.connection_timeout,
                settings.scheduler.clone(),
            )
        };
        let endpoint = params.endpoint();

        let mut attempt = 0;
        loop {
            self.record_attempt();
            tracing::debug!(endpoint = %endpoint, attempt, "connecting to broker");

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(PublishError::Shutdown),
                outcome = tokio::time::timeout(timeout, self.transport.connect(&params)) => outcome,
            };
            let error = match outcome {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(error)) => PublishError::from_transport(&endpoint, error),
                Err(_) => PublishError::Timeout {
                    endpoint: endpoint.clone(),
                    after: timeout,
                },
            };

            let failures = self.record_attempt_failure();
            let retry_in = (attempt + 1 < attempts).then(|| scheduler.delay(attempt));
            tracing::warn!(
                endpoint = %endpoint,
                attempt,
                consecutive_failures = failures,
                retry_in = ?retry_in,
                error = %error,
                "broker connection attempt failed"
            );
            self.events.emit(&ClientEvent::ConnectAttemptFailed {
                timestamp: Instant::now(),
                attempt,
                error: error.to_string(),
                retry_in,
            });

            let Some(delay) = retry_in else {
                return Err(error);
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(PublishError::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

struct Rearm<'a, T: BrokerTransport>(&'a Core<T>);

impl<T: BrokerTransport> Drop for Rearm<'_, T> {
    fn drop(&mut self) {
        self.0.manager.reset_shutdown();
        self.0.supervisor.reopen();
    }
}

impl<T: BrokerTransport> Core<T> {
    /// Caller-driven connect. Errors propagate to the caller.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), PublishError> {
        if !self.manager.params().enabled {
            tracing::debug!("publisher disabled, not connecting");
            return Ok(());
        }
        if !self.manager.begin_connect() {
            tracing::debug!(state = %self.manager.state(), "connect ignored");
            return Ok(());
        }

        let token = self.manager.shutdown_token();
        match self.manager.attempt_loop(&token).await {
            Ok(handle) => match self.manager.complete(ConnectionState::Connecting, handle) {
                Ok(()) => {
                    self.on_established(&token).await;
                    Ok(())
                }
                Err(handle) => {
                    self.manager.transport().close(&handle).await;
                    Err(PublishError::Shutdown)
                }
            },
            Err(PublishError::Shutdown) => Err(PublishError::Shutdown),
            Err(error) => {
                self.manager.fail(ConnectionState::Connecting);
                Err(error)
            }
        }
    }

    /// Tears the session down. Safe to call any number of times.
    pub(crate) async fn disconnect(self: &Arc<Self>) {
        self.teardown(false).await
    }

    /// Disconnects and connects again with the current settings. Runs as
    /// the supervisor's reconfigure task, so a user `disconnect()` cancels it.
    pub(crate) async fn cycle_session(self: &Arc<Self>) {
        tracing::info!("reconnecting with updated settings");
        self.teardown(true).await;
        if let Err(error) = self.connect().await {
            tracing::error!(error = %error, "reconnection with updated settings failed");
        }
    }

    /// Schedules [`cycle_session`](Self::cycle_session) on a tracked task.
    pub(crate) fn schedule_cycle(self: &Arc<Self>) -> Option<AbortHandle> {
        let task = self.supervisor.spawn_reconfigure(self);
        if task.is_none() {
            tracing::debug!("shutting down, settings change applies on next connect");
        }
        task
    }

    async fn teardown(self: &Arc<Self>, cycling: bool) {
        self.manager.shutdown_token().cancel();
        let handle = self.manager.mark_disconnected();
        // Re-arms the client even if this future is dropped part-way.
        let _rearm = Rearm(self);
        if cycling {
            self.supervisor.shutdown_for_cycle().await;
        } else {
            self.supervisor.shutdown().await;
        }

        if let Some(handle) = handle {
            let params = self.manager.params();
            if params.announce_status {
                self.announce_status(&handle, &params, "offline").await;
            }
            self.manager.transport().close(&handle).await;
            tracing::info!(endpoint = %params.endpoint(), "disconnected from broker");
        }
    }

    /// Starts the background reconnect sequence after a lost session.
    /// No-op unless `Connected`.
    pub(crate) fn initiate_reconnection(self: &Arc<Self>) {
        let token = self.manager.shutdown_token();
        if token.is_cancelled() || !self.manager.begin_reconnect() {
            return;
        }
        tracing::info!("broker session lost, reconnecting in background");
        if !self.supervisor.spawn_reconnect(self, token) {
            self.manager.fail(ConnectionState::Reconnecting);
        }
    }

    /// The bounded retry sequence run by the reconnect task.
    pub(crate) async fn reconnect(self: &Arc<Self>, token: CancellationToken) {
        if let Some(stale) = self.manager.take_handle() {
            self.manager.transport().close(&stale).await;
        }

        match self.manager.attempt_loop(&token).await {
            Ok(handle) => match self.manager.complete(ConnectionState::Reconnecting, handle) {
                Ok(()) => self.on_established(&token).await,
                Err(handle) => self.manager.transport().close(&handle).await,
            },
            Err(PublishError::Shutdown) => {
                tracing::debug!("reconnection cancelled by shutdown");
            }
            Err(error) => {
                tracing::error!(error = %error, "reconnection attempts exhausted");
                self.manager.fail(ConnectionState::Reconnecting);
            }
        }
    }

    /// Runs after every successful (re)connection: background tasks,
    /// subscriptions, status announcement, then a queue flush.
    async fn on_established(self: &Arc<Self>, token: &CancellationToken) {
        let Some(handle) = self.manager.connected_handle() else {
            return;
        };
        let params = self.manager.params();
        tracing::info!(endpoint = %params.endpoint(), client_id = %params.client_id, "connected to broker");

        self.supervisor.start_session(self, &handle, token);

        for filter in self.handlers.filters() {
            let result = self
                .manager
                .transport()
                .subscribe(&handle, &filter, params.qos)
                .await;
            if let Err(error) = result {
                tracing::warn!(filter = %filter, error = %error, "failed to restore subscription");
            }
        }

        if params.announce_status {
            self.announce_status(&handle, &params, "online").await;
        }

        self.schedule_flush();
    }

    async fn announce_status(&self, handle: &T::Handle, params: &ConnectionParams, status: &str) {
        let topic = topic::qualify(&params.topic_prefix, STATUS_TOPIC);
        let timeout = self.manager.config().connection_timeout;
        let publish = self.manager.transport().publish(
            handle,
            &topic,
            status.as_bytes(),
            params.qos,
            true,
        );
        match tokio::time::timeout(timeout, publish).await {
            Ok(Ok(())) => tracing::debug!(topic = %topic, status, "status announced"),
            Ok(Err(error)) => tracing::warn!(topic = %topic, error = %error, "status announcement failed"),
            Err(_) => tracing::warn!(topic = %topic, "status announcement timed out"),
        }
    }
}
