//! A cached, self-refreshing view of one resource key.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::bus::{BusSubscription, InvalidationBus, InvalidationEvent, kinds};
use crate::cache::{CacheStore, CacheValue, KeyPattern, Priority, SetOptions};
use crate::coordinator::{BoxError, FetchError, RequestCoordinator, ScheduleOptions};
use crate::multiplexer::ChannelHandle;

pub(crate) type FetchFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;

/// What a consumer currently sees for a resource.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot<V> {
    /// Last known value, possibly stale.
    pub value: Option<V>,
    /// No value yet and a fetch is running.
    pub loading: bool,
    /// A fetch is running.
    pub validating: bool,
    /// Error of the most recent fetch; cleared by the next success.
    pub error: Option<FetchError>,
}

impl<V> Default for ResourceSnapshot<V> {
    fn default() -> Self {
        Self {
            value: None,
            loading: false,
            validating: false,
            error: None,
        }
    }
}

/// Why a resource is revalidating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Revalidate {
    /// Re-read the cache; fetch only when the entry is stale or absent.
    Check,
    /// A push event arrived; fetch regardless of staleness, throttle applies.
    Push,
    /// Explicit refresh; bypass the throttle.
    Force,
}

pub(crate) struct ResourceCore<V: CacheValue> {
    pub(crate) key: String,
    pub(crate) fetch: FetchFn<V>,
    pub(crate) priority: Priority,
    pub(crate) throttle: Option<Duration>,
    pub(crate) set_options: SetOptions,
    pub(crate) invalidation_kinds: Vec<String>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) requests: RequestCoordinator,
    pub(crate) bus: InvalidationBus,
    pub(crate) state: watch::Sender<ResourceSnapshot<V>>,
    pub(crate) disposed: AtomicBool,
    pub(crate) checks: AtomicU64,
}

impl<V: CacheValue> ResourceCore<V> {
    pub(crate) fn revalidate(self: &Arc<Self>, reason: Revalidate) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        match reason {
            Revalidate::Check => {
                self.checks.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = self.cache.get::<V>(&self.key) {
                    let stale = entry.is_stale();
                    self.state.send_modify(|state| {
                        state.value = Some(entry.value);
                        state.loading = false;
                    });
                    if !stale {
                        return;
                    }
                }
                self.spawn_fetch(false);
            }
            Revalidate::Push => self.spawn_fetch(false),
            Revalidate::Force => self.spawn_fetch(true),
        }
    }

    /// React to a bus event. Each event triggers at most one check.
    pub(crate) fn on_event(self: &Arc<Self>, event: &InvalidationEvent) {
        let kind = event.kind.as_str();
        if self
            .invalidation_kinds
            .iter()
            .any(|prefix| kind.starts_with(prefix.as_str()))
        {
            debug!(key = %self.key, kind, "Invalidation class matched; purging entry");
            self.cache.invalidate(&KeyPattern::exact(self.key.as_str()));
            self.requests.reset_throttle(&self.key);
            self.revalidate(Revalidate::Check);
        } else if kind == kinds::FOREGROUND_RESUMED || self.is_targeted_by(event) {
            self.revalidate(Revalidate::Check);
        }
    }

    /// Any event aimed at this key, whatever its kind. Untargeted events
    /// only count for the generic refresh and invalidation kinds.
    fn is_targeted_by(&self, event: &InvalidationEvent) -> bool {
        match event.target {
            KeyPattern::All => {
                event.kind == kinds::REFRESH || event.kind == kinds::CACHE_INVALIDATED
            }
            _ => event.targets(&self.key),
        }
    }

    /// Schedule a fetch and return its result.
    ///
    /// On success the producer itself stores the value and emits `REFRESH`
    /// before the request completes, so joined callers and bus listeners
    /// observe the new entry together.
    pub(crate) fn fetch(self: &Arc<Self>, force: bool) -> BoxFuture<'static, Result<V, FetchError>> {
        self.state.send_modify(|state| {
            state.validating = true;
            state.loading = state.value.is_none();
        });

        let producer = {
            let fetch = Arc::clone(&self.fetch);
            let cache = Arc::clone(&self.cache);
            let bus = self.bus.clone();
            let key = self.key.clone();
            let set_options = self.set_options;
            move || async move {
                let value = fetch().await?;
                cache.set(&key, value.clone(), set_options);
                bus.emit(InvalidationEvent::refresh(key));
                Ok::<V, BoxError>(value)
            }
        };

        let mut options = ScheduleOptions::default().with_priority(self.priority);
        options.force = force;
        options.throttle = self.throttle;

        let request = self.requests.schedule(self.key.clone(), producer, options);
        let core = Arc::downgrade(self);
        async move {
            let result = request.await;
            match core.upgrade() {
                Some(core) => core.complete(result),
                None => result,
            }
        }
        .boxed()
    }

    fn spawn_fetch(self: &Arc<Self>, force: bool) {
        let request = self.fetch(force);
        drop(self.requests.spawn(request));
    }

    /// Publish the outcome of a fetch. A throttled call is answered from the
    /// cache, which may hold a newer value than the last fetch produced.
    fn complete(&self, result: Result<V, FetchError>) -> Result<V, FetchError> {
        let result = match result {
            Err(err) if err.is_throttled() => match self.cache.get::<V>(&self.key) {
                Some(entry) => Ok(entry.value),
                None => Err(err),
            },
            other => other,
        };

        self.state.send_modify(|state| {
            state.loading = false;
            state.validating = false;
            match &result {
                Ok(value) => {
                    state.value = Some(value.clone());
                    state.error = None;
                }
                Err(err) if err.is_throttled() => {}
                Err(err) => state.error = Some(err.clone()),
            }
        });
        result
    }
}

/// Live view of a resource returned by
/// [`SyncCoordinator::use_synchronized_resource`](super::SyncCoordinator::use_synchronized_resource).
///
/// Holds one bus subscription and, for push-enabled resources, one channel
/// subscription. Both are released by [`dispose`](Self::dispose) or on drop.
/// A resource created on a disposed coordinator holds neither.
pub struct SynchronizedResource<V: CacheValue> {
    pub(crate) core: Arc<ResourceCore<V>>,
    pub(crate) bus_subscription: Option<BusSubscription>,
    pub(crate) channel: Option<ChannelHandle>,
}

impl<V: CacheValue> SynchronizedResource<V> {
    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn snapshot(&self) -> ResourceSnapshot<V> {
        self.core.state.borrow().clone()
    }

    /// Convenience for `snapshot().value`.
    pub fn value(&self) -> Option<V> {
        self.core.state.borrow().value.clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<ResourceSnapshot<V>> {
        self.core.state.subscribe()
    }

    /// Force a fetch that bypasses the throttle window.
    pub async fn refresh(&self) -> Result<V, FetchError> {
        self.core.fetch(true).await
    }

    /// Staleness checks run so far, including the initial one.
    pub fn check_count(&self) -> u64 {
        self.core.checks.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Release the bus and channel subscriptions. Calling it again does nothing.
    ///
    /// A fetch already in flight still completes and updates the cache.
    pub fn dispose(&self) {
        let already = self.core.disposed.swap(true, Ordering::AcqRel);
        // Both releases are idempotent on their own.
        if let Some(subscription) = &self.bus_subscription {
            subscription.unsubscribe();
        }
        if let Some(channel) = &self.channel {
            channel.unsubscribe();
        }
        if !already {
            debug!(key = %self.core.key, "Disposed synchronized resource");
        }
    }
}

impl<V: CacheValue> Drop for SynchronizedResource<V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub(crate) fn weak_handler<V: CacheValue>(
    core: &Arc<ResourceCore<V>>,
) -> impl Fn(&InvalidationEvent) + Send + Sync + 'static {
    let core: Weak<ResourceCore<V>> = Arc::downgrade(core);
    move |event| {
        if let Some(core) = core.upgrade() {
            core.on_event(event);
        }
    }
}
