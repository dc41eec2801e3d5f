//! The broker transport abstraction.

use std::future::Future;

use futures::stream::BoxStream;

use crate::config::{ConnectionParams, QoS};
use crate::error::TransportError;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Full topic the message was published on.
    pub topic: String,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether the broker delivered a retained message.
    pub retain: bool,
}

impl InboundMessage {
    /// Creates an inbound message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// The body as UTF-8, if it is valid.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decodes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.payload)
    }
}

/// Stream of inbound messages for one session.
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// A broker session factory and the operations on an open session.
///
/// The client never speaks a wire protocol itself; every broker interaction
/// goes through this trait. Implementations should fail fast and report
/// [`TransportError::Rejected`] only when retrying the same request cannot
/// succeed.
pub trait BrokerTransport: Send + Sync + 'static {
    /// An open session.
    type Handle: Send + Sync + 'static;

    /// Opens a session. The client bounds this call with the connection timeout.
    fn connect(
        &self,
        params: &ConnectionParams,
    ) -> impl Future<Output = Result<Self::Handle, TransportError>> + Send;

    /// Publishes one message on a full topic.
    fn publish(
        &self,
        handle: &Self::Handle,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to a full topic filter.
    fn subscribe(
        &self,
        handle: &Self::Handle,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Removes a subscription.
    fn unsubscribe(
        &self,
        handle: &Self::Handle,
        filter: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Takes the inbound message stream of a session, if the transport
    /// supports receiving. Called once per session.
    fn inbound(&self, handle: &Self::Handle) -> Option<InboundStream>;

    /// Whether the session is still usable.
    fn is_healthy(&self, handle: &Self::Handle) -> impl Future<Output = bool> + Send;

    /// Releases the session. Must not fail.
    fn close(&self, handle: &Self::Handle) -> impl Future<Output = ()> + Send;
}
