//! Push-channel subscription multiplexing.
//!
//! Many logical subscribers share one transport connection per
//! [`ChannelKey`]. The connection is opened by a driver task when the first
//! subscriber arrives and closed once the last one leaves. Transport failures
//! are retried with exponential backoff; after too many consecutive failures
//! the channel degrades to polling and fires synthetic updates instead.

mod machine;
mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics_keys::{CHANNEL_OPEN, CHANNEL_POLLING, CHANNEL_RECONNECT, CHANNELS_ACTIVE};
use crate::util::isolate::run_isolated;
use crate::util::lock::mutex_lock;

pub use machine::{ChannelConfig, ChannelMachine, ChannelMode, ChannelState, Transition};
pub use transport::{ChannelKey, LoopbackTransport, Transport, TransportError, TransportStream};

const SOURCE: &str = "multiplexer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// Delivered by the live transport.
    Live,
    /// Synthetic tick while the channel is polling; carries no payload.
    PollingUpdate,
}

impl PushKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::PollingUpdate => "polling_update",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub channel: ChannelKey,
    pub kind: PushKind,
    pub payload: Bytes,
    pub received_at: OffsetDateTime,
}

/// Snapshot of a channel's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub key: ChannelKey,
    pub state: ChannelState,
    pub mode: ChannelMode,
    pub ref_count: usize,
    pub reconnect_attempts: u32,
    pub last_event_at: Option<OffsetDateTime>,
}

type Callback = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// State shared between a channel's subscribers and its driver task.
struct ChannelShared {
    machine: Mutex<ChannelMachine>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    last_event_at: Mutex<Option<OffsetDateTime>>,
}

impl ChannelShared {
    fn deliver(&self, event: &PushEvent) {
        *mutex_lock(&self.last_event_at, SOURCE, "deliver.last_event_at") = Some(event.received_at);
        let subscribers: Vec<Callback> = mutex_lock(&self.subscribers, SOURCE, "deliver")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in subscribers {
            if let Err(panic) = run_isolated(|| callback(event)) {
                warn!(
                    channel = %event.channel,
                    panic = %panic,
                    "Channel subscriber panicked; continuing delivery"
                );
            }
        }
    }
}

struct Channel {
    shared: Arc<ChannelShared>,
    shutdown: watch::Sender<bool>,
}

struct MuxInner {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    next_id: AtomicU64,
    runtime: Option<Handle>,
}

impl MuxInner {
    fn release(&self, key: &ChannelKey, id: u64) {
        let mut channels = mutex_lock(&self.channels, SOURCE, "release");
        let Some(channel) = channels.get(key) else {
            return;
        };

        let remaining = {
            let mut subscribers = mutex_lock(&channel.shared.subscribers, SOURCE, "release.subscribers");
            subscribers.retain(|(subscriber, _)| *subscriber != id);
            subscribers.len()
        };
        if remaining > 0 {
            return;
        }

        if let Some(channel) = channels.remove(key) {
            let _ = channel.shutdown.send(true);
            info!(channel = %key, "Last subscriber left; closing channel");
        }
        gauge!(CHANNELS_ACTIVE).set(channels.len() as f64);
    }
}

/// Reference-counted fan-out of push channels to subscribers.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Subscribe `on_event` to `key`, opening the channel if this is the
    /// first subscriber.
    ///
    /// Subscribers of one channel are invoked in subscription order.
    pub fn subscribe<F>(&self, key: ChannelKey, on_event: F) -> ChannelHandle
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = mutex_lock(&self.inner.channels, SOURCE, "subscribe");

        let channel = channels.entry(key.clone()).or_insert_with(|| {
            info!(channel = %key, "First subscriber; opening channel");
            spawn_channel(&self.inner, key.clone())
        });
        let callback: Callback = Arc::new(on_event);
        mutex_lock(&channel.shared.subscribers, SOURCE, "subscribe.subscribers").push((id, callback));
        gauge!(CHANNELS_ACTIVE).set(channels.len() as f64);

        ChannelHandle {
            id,
            key,
            mux: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    pub fn status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        let channels = mutex_lock(&self.inner.channels, SOURCE, "status");
        let channel = channels.get(key)?;
        let machine = mutex_lock(&channel.shared.machine, SOURCE, "status.machine").clone();
        Some(ChannelStatus {
            key: key.clone(),
            state: machine.state(),
            mode: machine.mode(),
            ref_count: mutex_lock(&channel.shared.subscribers, SOURCE, "status.subscribers").len(),
            reconnect_attempts: machine.attempts(),
            last_event_at: *mutex_lock(&channel.shared.last_event_at, SOURCE, "status.last_event_at"),
        })
    }

    /// Channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        mutex_lock(&self.inner.channels, SOURCE, "channel_count").len()
    }

    /// Close every channel. Outstanding handles become no-ops.
    pub fn shutdown(&self) {
        let mut channels = mutex_lock(&self.inner.channels, SOURCE, "shutdown");
        let closed = channels.len();
        for (_, channel) in channels.drain() {
            let _ = channel.shutdown.send(true);
        }
        gauge!(CHANNELS_ACTIVE).set(0.0);
        if closed > 0 {
            info!(closed, "Closed all push channels");
        }
    }
}

/// A subscriber's claim on a channel. Released on `unsubscribe` or drop.
pub struct ChannelHandle {
    id: u64,
    key: ChannelKey,
    mux: Weak<MuxInner>,
    released: AtomicBool,
}

impl ChannelHandle {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Release this subscription. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.release(&self.key, self.id);
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn spawn_channel(inner: &Arc<MuxInner>, key: ChannelKey) -> Channel {
    let shared = Arc::new(ChannelShared {
        machine: Mutex::new(ChannelMachine::new(inner.config)),
        subscribers: Mutex::new(Vec::new()),
        last_event_at: Mutex::new(None),
    });
    let (shutdown, signal) = watch::channel(false);

    let driver = drive_channel(key, Arc::clone(&shared), Arc::clone(&inner.transport), signal);
    match &inner.runtime {
        Some(runtime) => drop(runtime.spawn(driver)),
        None => drop(tokio::spawn(driver)),
    }

    Channel { shared, shutdown }
}

async fn drive_channel(
    key: ChannelKey,
    shared: Arc<ChannelShared>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let opened = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            opened = transport.open(&key) => opened,
        };

        match opened {
            Ok(mut stream) => {
                mutex_lock(&shared.machine, SOURCE, "drive.opened").on_opened();
                counter!(CHANNEL_OPEN).increment(1);
                info!(channel = %key, "Channel open");

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            drop(stream);
                            mutex_lock(&shared.machine, SOURCE, "drive.close").close();
                            transport.close(&key).await;
                            debug!(channel = %key, "Channel transport closed");
                            return;
                        }
                        item = stream.next() => match item {
                            Some(Ok(payload)) => {
                                if mutex_lock(&shared.machine, SOURCE, "drive.event").on_event() {
                                    shared.deliver(&PushEvent {
                                        channel: key.clone(),
                                        kind: PushKind::Live,
                                        payload,
                                        received_at: OffsetDateTime::now_utc(),
                                    });
                                }
                            }
                            Some(Err(err)) => {
                                warn!(channel = %key, error = %err, "Channel transport error");
                                break;
                            }
                            None => {
                                info!(channel = %key, "Channel disconnected");
                                break;
                            }
                        },
                    }
                }

                // Every successful open is paired with one close.
                drop(stream);
                transport.close(&key).await;
                debug!(channel = %key, "Dropped connection released");
            }
            Err(err) => {
                warn!(channel = %key, error = %err, "Failed to open channel");
            }
        }

        let transition = {
            let mut machine = mutex_lock(&shared.machine, SOURCE, "drive.failure");
            machine.on_failure();
            machine.recover()
        };

        match transition {
            Transition::Reconnect(delay) => {
                counter!(CHANNEL_RECONNECT).increment(1);
                info!(channel = %key, delay_ms = delay.as_millis() as u64, "Reconnecting channel");
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                mutex_lock(&shared.machine, SOURCE, "drive.reconnect").begin_reconnect();
            }
            Transition::Poll(interval) => {
                counter!(CHANNEL_POLLING).increment(1);
                info!(
                    channel = %key,
                    interval_ms = interval.as_millis() as u64,
                    "Reconnects exhausted; channel degraded to polling"
                );
                poll_channel(&key, &shared, interval, &mut shutdown).await;
                break;
            }
        }
    }

    mutex_lock(&shared.machine, SOURCE, "drive.exit").close();
}

async fn poll_channel(
    key: &ChannelKey,
    shared: &ChannelShared,
    interval: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                debug!(channel = %key, "Polling tick");
                shared.deliver(&PushEvent {
                    channel: key.clone(),
                    kind: PushKind::PollingUpdate,
                    payload: Bytes::new(),
                    received_at: OffsetDateTime::now_utc(),
                });
            }
        }
    }
}
