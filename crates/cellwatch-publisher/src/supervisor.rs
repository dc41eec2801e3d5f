//! Background task supervision.
//!
//! Every task the client spawns is recorded here so `disconnect()` can
//! cancel and join all of them. Spawning is refused while a shutdown is in
//! progress, which keeps a late reconnect from leaking tasks past it.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::client::Core;
use crate::lock;
use crate::state::ConnectionState;
use crate::transport::{BrokerTransport, InboundMessage};

/// Kinds of background work run by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Periodic session liveness probe.
    HealthCheck,
    /// Periodic or on-demand queue flushing.
    MessageProcessor,
    /// Routes inbound messages to subscription handlers.
    InboundDispatch,
    /// Re-establishes a lost session.
    Reconnect,
    /// Disconnect/connect cycle after a settings change.
    Reconfigure,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            TaskKind::HealthCheck => "health_check",
            TaskKind::MessageProcessor => "message_processor",
            TaskKind::InboundDispatch => "inbound_dispatch",
            TaskKind::Reconnect => "reconnect",
            TaskKind::Reconfigure => "reconfigure",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Registry {
    accepting: bool,
    session: Vec<(TaskKind, JoinHandle<()>)>,
    reconnect: Option<JoinHandle<()>>,
    reconfigure: Option<JoinHandle<()>>,
}

pub(crate) struct TaskSupervisor {
    registry: Mutex<Registry>,
}

impl TaskSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                accepting: true,
                session: Vec::new(),
                reconnect: None,
                reconfigure: None,
            }),
        }
    }

    /// Replaces the per-session tasks with fresh ones bound to `token`.
    pub(crate) fn start_session<T: BrokerTransport>(
        &self,
        core: &Arc<Core<T>>,
        handle: &Arc<T::Handle>,
        token: &CancellationToken,
    ) -> bool {
        let mut registry = lock(&self.registry);
        if !registry.accepting || token.is_cancelled() {
            tracing::debug!("supervisor not accepting session tasks");
            return false;
        }

        for (kind, task) in registry.session.drain(..) {
            tracing::trace!(task = %kind, "replacing session task");
            task.abort();
        }

        registry.session.push((
            TaskKind::HealthCheck,
            tokio::spawn(health_check_loop(
                Arc::clone(core),
                Arc::clone(handle),
                token.clone(),
            )),
        ));
        registry.session.push((
            TaskKind::MessageProcessor,
            tokio::spawn(message_processor_loop(Arc::clone(core), token.clone())),
        ));
        if let Some(inbound) = core.manager.transport().inbound(handle) {
            registry.session.push((
                TaskKind::InboundDispatch,
                tokio::spawn(inbound_dispatch_loop(Arc::clone(core), inbound, token.clone())),
            ));
        }
        true
    }

    /// Starts a reconnect sequence, cancelling any previous one.
    pub(crate) fn spawn_reconnect<T: BrokerTransport>(
        &self,
        core: &Arc<Core<T>>,
        token: CancellationToken,
    ) -> bool {
        let mut registry = lock(&self.registry);
        if !registry.accepting {
            return false;
        }
        if let Some(previous) = registry.reconnect.take() {
            previous.abort();
        }
        registry.reconnect = Some(tokio::spawn(reconnect_loop(Arc::clone(core), token)));
        true
    }

    /// Starts a session cycle after a settings change, replacing any
    /// previous one. `None` while shutting down.
    pub(crate) fn spawn_reconfigure<T: BrokerTransport>(&self, core: &Arc<Core<T>>) -> Option<AbortHandle> {
        let mut registry = lock(&self.registry);
        if !registry.accepting {
            return None;
        }
        if let Some(previous) = registry.reconfigure.take() {
            previous.abort();
        }
        let task = tokio::spawn(reconfigure_loop(Arc::clone(core)));
        let abort = task.abort_handle();
        registry.reconfigure = Some(task);
        Some(abort)
    }

    /// Cancels every tracked task and waits for all of them to finish.
    ///
    /// Spawning stays refused until [`reopen`](Self::reopen).
    pub(crate) async fn shutdown(&self) {
        self.stop(true).await
    }

    /// Like [`shutdown`](Self::shutdown) but leaves a running session cycle
    /// alone. Used by that cycle to tear down the old session.
    pub(crate) async fn shutdown_for_cycle(&self) {
        self.stop(false).await
    }

    async fn stop(&self, include_reconfigure: bool) {
        let tasks: Vec<(TaskKind, JoinHandle<()>)> = {
            let mut registry = lock(&self.registry);
            registry.accepting = false;
            let mut tasks: Vec<_> = registry.session.drain(..).collect();
            if let Some(reconnect) = registry.reconnect.take() {
                tasks.push((TaskKind::Reconnect, reconnect));
            }
            if include_reconfigure {
                if let Some(reconfigure) = registry.reconfigure.take() {
                    tasks.push((TaskKind::Reconfigure, reconfigure));
                }
            }
            tasks
        };

        for (_, task) in &tasks {
            task.abort();
        }
        for (kind, task) in tasks {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(task = %kind, error = %e, "background task panicked"),
            }
        }
    }

    pub(crate) fn reopen(&self) {
        lock(&self.registry).accepting = true;
    }

    /// Tracked tasks that have not finished yet.
    pub(crate) fn active(&self) -> usize {
        let registry = lock(&self.registry);
        registry
            .session
            .iter()
            .map(|(_, task)| task)
            .chain(registry.reconnect.iter())
            .chain(registry.reconfigure.iter())
            .filter(|task| !task.is_finished())
            .count()
    }
}

async fn health_check_loop<T: BrokerTransport>(
    core: Arc<Core<T>>,
    handle: Arc<T::Handle>,
    token: CancellationToken,
) {
    let period = core.manager.config().health_check_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        if core.manager.state() != ConnectionState::Connected {
            continue;
        }

        let timeout = core.manager.config().connection_timeout;
        let probe = core.manager.transport().is_healthy(&handle);
        let healthy = match AssertUnwindSafe(tokio::time::timeout(timeout, probe))
            .catch_unwind()
            .await
        {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(_)) => {
                tracing::warn!(?timeout, "health check timed out");
                false
            }
            Err(_) => {
                tracing::error!("health check panicked");
                false
            }
        };

        if !healthy {
            tracing::warn!("broker session unhealthy");
            core.initiate_reconnection();
            return;
        }
        tracing::trace!("broker session healthy");
    }
}

async fn message_processor_loop<T: BrokerTransport>(core: Arc<Core<T>>, token: CancellationToken) {
    loop {
        let period = core.manager.config().flush_interval;
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = core.flush_signal.notified() => {}
            _ = tokio::time::sleep(period) => {}
        }

        if core.manager.state() != ConnectionState::Connected || core.queue.is_empty() {
            continue;
        }
        if AssertUnwindSafe(core.flush()).catch_unwind().await.is_err() {
            tracing::error!("queue flush panicked");
        }
    }
}

async fn inbound_dispatch_loop<T: BrokerTransport>(
    core: Arc<Core<T>>,
    mut inbound: crate::transport::InboundStream,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            message = inbound.next() => message,
        };
        match message {
            Some(message) => dispatch(&core, message).await,
            None => {
                tracing::debug!("inbound stream closed");
                return;
            }
        }
    }
}

async fn dispatch<T: BrokerTransport>(core: &Core<T>, message: InboundMessage) {
    let handlers = core.handlers.matching(&message.topic);
    if handlers.is_empty() {
        tracing::debug!(topic = %message.topic, "no handler for inbound message");
        return;
    }

    for (filter, handler) in handlers {
        let call = handler.oneshot(message.clone());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(filter = %filter, topic = %message.topic, error = %error, "message handler failed")
            }
            Err(_) => tracing::error!(filter = %filter, topic = %message.topic, "message handler panicked"),
        }
    }
}

async fn reconnect_loop<T: BrokerTransport>(core: Arc<Core<T>>, token: CancellationToken) {
    if AssertUnwindSafe(core.reconnect(token)).catch_unwind().await.is_err() {
        tracing::error!("reconnect task panicked");
        core.manager.fail(ConnectionState::Reconnecting);
    }
}

async fn reconfigure_loop<T: BrokerTransport>(core: Arc<Core<T>>) {
    if AssertUnwindSafe(core.cycle_session()).catch_unwind().await.is_err() {
        tracing::error!("session cycle panicked");
    }
}
