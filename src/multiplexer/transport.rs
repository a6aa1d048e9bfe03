//! Push transport boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "multiplexer::transport";

/// Stream of raw push payloads. The end of the stream is a disconnect.
pub type TransportStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Transport failures. Retried by the channel driver and never surfaced to
/// subscribers.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to open channel `{channel}`: {message}")]
    Open { channel: String, message: String },
    #[error("channel `{channel}` failed: {message}")]
    Stream { channel: String, message: String },
}

impl TransportError {
    pub fn open(channel: &ChannelKey, message: impl Into<String>) -> Self {
        Self::Open {
            channel: channel.to_string(),
            message: message.into(),
        }
    }

    pub fn stream(channel: &ChannelKey, message: impl Into<String>) -> Self {
        Self::Stream {
            channel: channel.to_string(),
            message: message.into(),
        }
    }
}

/// Identity of a push channel: a resource plus optional filter parameters.
///
/// Two keys with the same resource and filters are the same channel no matter
/// the order filters were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKey {
    resource: String,
    filters: BTreeMap<String, String>,
}

impl ChannelKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        for (index, (name, value)) in self.filters.iter().enumerate() {
            let separator = if index == 0 { '?' } else { '&' };
            write!(f, "{separator}{name}={value}")?;
        }
        Ok(())
    }
}

impl From<&str> for ChannelKey {
    fn from(resource: &str) -> Self {
        Self::new(resource)
    }
}

/// A live push-update connection provider.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection for `channel`.
    async fn open(&self, channel: &ChannelKey) -> Result<TransportStream, TransportError>;

    /// Release a connection previously opened for `channel`.
    async fn close(&self, channel: &ChannelKey);
}

/// In-process transport: payloads published here are delivered to the open
/// connection of the matching channel.
///
/// Useful for offline operation and for exercising reconnect behaviour.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
    unreachable: bool,
    failing_opens: usize,
    connections: HashMap<ChannelKey, mpsc::UnboundedSender<Result<Bytes, TransportError>>>,
    opens: HashMap<ChannelKey, usize>,
    connects: HashMap<ChannelKey, usize>,
    closes: HashMap<ChannelKey, usize>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unreachable, every open attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        mutex_lock(&self.state, SOURCE, "set_reachable").unreachable = !reachable;
    }

    /// Fail the next `count` open attempts.
    pub fn fail_next_opens(&self, count: usize) {
        mutex_lock(&self.state, SOURCE, "fail_next_opens").failing_opens = count;
    }

    /// Deliver `payload` on the open connection of `channel`.
    ///
    /// Returns false when the channel has no open connection.
    pub fn publish(&self, channel: &ChannelKey, payload: impl Into<Bytes>) -> bool {
        mutex_lock(&self.state, SOURCE, "publish")
            .connections
            .get(channel)
            .is_some_and(|sender| sender.unbounded_send(Ok(payload.into())).is_ok())
    }

    /// Terminate the connection of `channel` with an error.
    pub fn fail(&self, channel: &ChannelKey, message: &str) -> bool {
        let sender = mutex_lock(&self.state, SOURCE, "fail")
            .connections
            .remove(channel);
        sender.is_some_and(|sender| {
            sender
                .unbounded_send(Err(TransportError::stream(channel, message)))
                .is_ok()
        })
    }

    /// End the connection of `channel` without an error.
    pub fn disconnect(&self, channel: &ChannelKey) -> bool {
        mutex_lock(&self.state, SOURCE, "disconnect")
            .connections
            .remove(channel)
            .is_some()
    }

    pub fn is_connected(&self, channel: &ChannelKey) -> bool {
        mutex_lock(&self.state, SOURCE, "is_connected")
            .connections
            .contains_key(channel)
    }

    /// Open attempts made for `channel`, successful or not.
    pub fn opens(&self, channel: &ChannelKey) -> usize {
        let state = mutex_lock(&self.state, SOURCE, "opens");
        state.opens.get(channel).copied().unwrap_or(0)
    }

    /// Open attempts for `channel` that produced a connection.
    pub fn connects(&self, channel: &ChannelKey) -> usize {
        let state = mutex_lock(&self.state, SOURCE, "connects");
        state.connects.get(channel).copied().unwrap_or(0)
    }

    pub fn closes(&self, channel: &ChannelKey) -> usize {
        let state = mutex_lock(&self.state, SOURCE, "closes");
        state.closes.get(channel).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, channel: &ChannelKey) -> Result<TransportStream, TransportError> {
        let mut state = mutex_lock(&self.state, SOURCE, "open");
        *state.opens.entry(channel.clone()).or_default() += 1;

        if state.unreachable {
            return Err(TransportError::open(channel, "loopback unreachable"));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::open(channel, "scripted open failure"));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.connections.insert(channel.clone(), sender);
        *state.connects.entry(channel.clone()).or_default() += 1;
        Ok(receiver.boxed())
    }

    async fn close(&self, channel: &ChannelKey) {
        let mut state = mutex_lock(&self.state, SOURCE, "close");
        *state.closes.entry(channel.clone()).or_default() += 1;
        state.connections.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_is_canonical() {
        let a = ChannelKey::new("orders")
            .with_filter("status", "open")
            .with_filter("region", "eu");
        let b = ChannelKey::new("orders")
            .with_filter("region", "eu")
            .with_filter("status", "open");

        assert_eq!(a, b);
        assert_eq!(a.to_string(), "orders?region=eu&status=open");
        assert_eq!(ChannelKey::from("orders").to_string(), "orders");
    }

    #[tokio::test]
    async fn loopback_delivers_to_open_connection() {
        let transport = LoopbackTransport::new();
        let key = ChannelKey::new("orders");
        assert!(!transport.publish(&key, "early"));

        let mut stream = transport.open(&key).await.expect("open");
        assert!(transport.publish(&key, "hello"));
        let payload = stream.next().await.expect("item").expect("payload");
        assert_eq!(payload, Bytes::from_static(b"hello"));

        assert!(transport.disconnect(&key));
        assert!(stream.next().await.is_none());
        assert_eq!(transport.opens(&key), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let transport = LoopbackTransport::new();
        let key = ChannelKey::new("orders");
        transport.fail_next_opens(1);

        assert!(transport.open(&key).await.is_err());
        let mut stream = transport.open(&key).await.expect("second open");

        assert!(transport.fail(&key, "reset by peer"));
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::Stream { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(transport.opens(&key), 2);
    }
}
