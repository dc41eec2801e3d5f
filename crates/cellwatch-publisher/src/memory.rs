//! An in-process broker transport with fault injection.
//!
//! `MemoryTransport` records everything published through it and lets a
//! test script connection failures, publish failures, latency and dropped
//! sessions. Clones share state, so a test keeps one clone while the client
//! owns another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::config::{ConnectionParams, QoS};
use crate::error::TransportError;
use crate::lock;
use crate::topic;
use crate::transport::{BrokerTransport, InboundMessage, InboundStream};

/// A message accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    /// The body as UTF-8, if valid.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A session opened on a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
}

impl MemorySession {
    /// Sequence number of the session.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct State {
    next_session: u64,
    live: HashSet<u64>,
    inbound: HashMap<u64, mpsc::UnboundedSender<InboundMessage>>,
    connect_failures: VecDeque<TransportError>,
    publish_failures: VecDeque<TransportError>,
    connect_delay: Option<Duration>,
    connect_attempts: u64,
    closed: u64,
    last_params: Option<ConnectionParams>,
    published: Vec<PublishedMessage>,
    publish_attempts: Vec<String>,
    subscriptions: Vec<String>,
}

/// In-process [`BrokerTransport`].
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    /// Creates a broker that accepts every connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail with `error`.
    pub fn fail_connects(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        state
            .connect_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Makes the next `count` publishes fail with `error`.
    pub fn fail_publishes(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        state
            .publish_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        lock(&self.state).connect_delay = delay;
    }

    /// Breaks every open session as if the broker went away, forgetting
    /// their subscriptions. New sessions can still be opened.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.state);
        state.live.clear();
        state.inbound.clear();
        state.subscriptions.clear();
    }

    /// Delivers a message to every open session subscribed to `topic`.
    /// Returns the number of sessions reached.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let state = lock(&self.state);
        if !state.subscriptions.iter().any(|f| topic::matches(f, topic)) {
            return 0;
        }
        let message = InboundMessage::new(topic, payload);
        state
            .inbound
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    /// Messages accepted so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Topics of accepted messages, in order.
    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.state)
            .published
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }

    /// Topics of every publish call, including failed ones, in order.
    pub fn publish_attempts(&self) -> Vec<String> {
        lock(&self.state).publish_attempts.clone()
    }

    /// Forgets recorded publishes and attempts.
    pub fn clear_published(&self) {
        let mut state = lock(&self.state);
        state.published.clear();
        state.publish_attempts.clear();
    }

    /// Connection attempts so far.
    pub fn connect_attempts(&self) -> u64 {
        lock(&self.state).connect_attempts
    }

    /// Sessions closed by the client.
    pub fn closed_sessions(&self) -> u64 {
        lock(&self.state).closed
    }

    /// Sessions currently open and healthy.
    pub fn open_sessions(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Active subscription filters.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    /// Parameters of the most recent connection attempt.
    pub fn last_params(&self) -> Option<ConnectionParams> {
        lock(&self.state).last_params.clone()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryTransport")
            .field("open_sessions", &state.live.len())
            .field("published", &state.published.len())
            .finish_non_exhaustive()
    }
}

impl BrokerTransport for MemoryTransport {
    type Handle = MemorySession;

    async fn connect(&self, params: &ConnectionParams) -> Result<MemorySession, TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            state.last_params = Some(params.clone());
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        let id = state.next_session;
        state.next_session += 1;
        state.live.insert(id);
        Ok(MemorySession { id })
    }

    async fn publish(
        &self,
        handle: &MemorySession,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.publish_attempts.push(topic.to_string());
        if !state.live.contains(&handle.id) {
            return Err(TransportError::Connection("session closed".into()));
        }
        if let Some(error) = state.publish_failures.pop_front() {
            return Err(error);
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &MemorySession,
        filter: &str,
        _qos: QoS,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.live.contains(&handle.id) {
            return Err(TransportError::Connection("session closed".into()));
        }
        if !state.subscriptions.iter().any(|f| f == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: &MemorySession, filter: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.live.contains(&handle.id) {
            return Err(TransportError::Connection("session closed".into()));
        }
        state.subscriptions.retain(|f| f != filter);
        Ok(())
    }

    fn inbound(&self, handle: &MemorySession) -> Option<InboundStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).inbound.insert(handle.id, tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Some(stream.boxed())
    }

    async fn is_healthy(&self, handle: &MemorySession) -> bool {
        lock(&self.state).live.contains(&handle.id)
    }

    async fn close(&self, handle: &MemorySession) {
        let mut state = lock(&self.state);
        state.closed += 1;
        state.live.remove(&handle.id);
        state.inbound.remove(&handle.id);
    }
}
