//! Live reconfiguration from an external settings source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::BrokerClient;
use crate::config::BrokerSettings;
use crate::state::ConnectionState;
use crate::transport::BrokerTransport;
use crate::{lock, read, write};

/// Section name the publisher reads by default.
pub const DEFAULT_SECTION: &str = "mqtt";

/// Notification that a settings section changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    /// Section that changed.
    pub section: String,
    /// New contents of the section.
    pub values: Value,
}

/// A provider of settings sections that can announce changes.
pub trait ConfigSource: Send + Sync + 'static {
    /// Current contents of `section`.
    fn get(&self, section: &str) -> Option<Value>;

    /// Subscribes to change notifications.
    fn changes(&self) -> broadcast::Receiver<ConfigChange>;
}

/// A [`ConfigSource`] held in memory.
pub struct MemoryConfigSource {
    sections: RwLock<HashMap<String, Value>>,
    tx: broadcast::Sender<ConfigChange>,
}

impl MemoryConfigSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            sections: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Replaces a section and notifies subscribers.
    pub fn set(&self, section: impl Into<String>, values: Value) {
        let section = section.into();
        write(&self.sections).insert(section.clone(), values.clone());
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(ConfigChange { section, values });
    }
}

impl Default for MemoryConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for MemoryConfigSource {
    fn get(&self, section: &str) -> Option<Value> {
        read(&self.sections).get(section).cloned()
    }

    fn changes(&self) -> broadcast::Receiver<ConfigChange> {
        self.tx.subscribe()
    }
}

/// Applies settings changes to a running client.
///
/// Identity changes (endpoint, credentials, TLS, namespace, client id) made
/// while connected trigger a disconnect/connect cycle on a task owned by the
/// client's supervisor, so `disconnect()` cancels it like any other.
/// Capacity changes resize the queue in place. Invalid documents are logged
/// and ignored.
pub struct ConfigWatcher {
    watch_task: JoinHandle<()>,
    reconnect_task: Arc<Mutex<Option<AbortHandle>>>,
}

impl ConfigWatcher {
    /// Starts watching `section` of `source` on behalf of `client`.
    pub fn spawn<T, C>(client: BrokerClient<T>, source: Arc<C>, section: impl Into<String>) -> Self
    where
        T: BrokerTransport,
        C: ConfigSource,
    {
        let section = section.into();
        let reconnect_task = Arc::new(Mutex::new(None));
        let changes = source.changes();
        let watch_task = tokio::spawn(watch_loop(
            client,
            source,
            changes,
            section,
            Arc::clone(&reconnect_task),
        ));
        Self {
            watch_task,
            reconnect_task,
        }
    }

    /// Stops watching and cancels any pending reconnection.
    pub async fn stop(self) {
        self.watch_task.abort();
        let _ = self.watch_task.await;
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    /// True while a reconnection triggered by a settings change is running.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.reconnect_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

async fn watch_loop<T, C>(
    client: BrokerClient<T>,
    source: Arc<C>,
    mut changes: broadcast::Receiver<ConfigChange>,
    section: String,
    reconnect_task: Arc<Mutex<Option<AbortHandle>>>,
) where
    T: BrokerTransport,
    C: ConfigSource,
{
    loop {
        let values = match changes.recv().await {
            Ok(change) if change.section == section => change.values,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, section = %section, "config notifications lagged, re-reading section");
                match source.get(&section) {
                    Some(values) => values,
                    None => continue,
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!(section = %section, "config source closed");
                return;
            }
        };
        apply(&client, values, &reconnect_task);
    }
}

fn apply<T: BrokerTransport>(
    client: &BrokerClient<T>,
    values: Value,
    reconnect_task: &Mutex<Option<AbortHandle>>,
) {
    let parts = BrokerSettings::from_value(values).and_then(BrokerSettings::into_parts);
    let (params, config) = match parts {
        Ok(parts) => parts,
        Err(error) => {
            tracing::warn!(error = %error, "ignoring invalid publisher settings");
            return;
        }
    };

    let change = match client.apply_settings(params, config) {
        Ok(change) => change,
        Err(error) => {
            tracing::warn!(error = %error, "ignoring invalid publisher settings");
            return;
        }
    };
    tracing::info!(
        identity_changed = change.identity_changed,
        capacity = change.capacity,
        "publisher settings updated"
    );

    let needs_cycle = (change.identity_changed || change.enabled_changed)
        && client.state() == ConnectionState::Connected;
    if !needs_cycle {
        return;
    }

    *lock(reconnect_task) = client.schedule_session_cycle();
}
