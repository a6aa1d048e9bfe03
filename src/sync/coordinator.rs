use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{BusSubscription, InvalidationBus, InvalidationEvent, KindMatcher, kinds};
use crate::cache::{CacheStore, CacheValue, KeyPattern, Priority, SetOptions, Tier};
use crate::config::Settings;
use crate::coordinator::{BoxError, RequestCoordinator};
use crate::infra::InfraError;
use crate::infra::storage::{MemoryMedium, PersistentMedium, SqliteMedium};
use crate::multiplexer::{ChannelKey, LoopbackTransport, SubscriptionMultiplexer, Transport};
use crate::util::lock::mutex_lock;

use super::config::{ResourceClass, SyncConfig};
use super::resource::{FetchFn, ResourceCore, ResourceSnapshot, Revalidate, SynchronizedResource, weak_handler};

const SOURCE: &str = "sync::coordinator";

/// Per-resource options for [`SyncCoordinator::use_synchronized_resource`].
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Queue priority of fetches; also the cache priority of the entry.
    pub priority: Priority,
    /// Picks the default throttle window.
    pub class: ResourceClass,
    /// Push channel whose events trigger a refresh.
    pub channel_key: Option<ChannelKey>,
    /// Event kind prefixes that purge this resource and re-check it.
    pub invalidation_kinds: Vec<String>,
    /// Overrides the class throttle window.
    pub throttle: Option<Duration>,
    /// Overrides the cache's default expiry.
    pub expiry: Option<Duration>,
    pub tier: Tier,
}

impl ResourceOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self, class: ResourceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_channel(mut self, channel_key: ChannelKey) -> Self {
        self.channel_key = Some(channel_key);
        self
    }

    pub fn with_invalidation_kind(mut self, kind: impl Into<String>) -> Self {
        self.invalidation_kinds.push(kind.into());
        self
    }

    pub fn with_throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

struct SyncInner {
    config: SyncConfig,
    cache: Arc<CacheStore>,
    requests: RequestCoordinator,
    channels: SubscriptionMultiplexer,
    bus: InvalidationBus,
    purge: Mutex<Option<BusSubscription>>,
    disposed: AtomicBool,
}

/// Owner of one synchronization layer instance.
///
/// Every piece of shared state (cache, pending requests, channels, bus
/// handlers) lives here, so independent instances never interfere.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<SyncInner>,
}

pub struct SyncCoordinatorBuilder {
    config: SyncConfig,
    medium: Option<Arc<dyn PersistentMedium>>,
    transport: Option<Arc<dyn Transport>>,
}

impl SyncCoordinatorBuilder {
    /// Mirror persistent entries to `medium` and rehydrate from it.
    pub fn medium(mut self, medium: Arc<dyn PersistentMedium>) -> Self {
        self.medium = Some(medium);
        self
    }

    /// Push transport; defaults to an unconnected [`LoopbackTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> SyncCoordinator {
        let cache = match self.medium {
            Some(medium) => CacheStore::with_medium(self.config.cache.clone(), medium),
            None => CacheStore::new(self.config.cache.clone()),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport::new()) as Arc<dyn Transport>);

        let inner = Arc::new(SyncInner {
            cache: Arc::new(cache),
            requests: RequestCoordinator::new(self.config.max_concurrent),
            channels: SubscriptionMultiplexer::new(transport, self.config.channels),
            bus: InvalidationBus::new(),
            purge: Mutex::new(None),
            disposed: AtomicBool::new(false),
            config: self.config,
        });

        // Registered first so every resource handler sees the purged state.
        let purge = {
            let cache = Arc::clone(&inner.cache);
            let requests = inner.requests.clone();
            inner.bus.on(kinds::CACHE_INVALIDATED, move |event| {
                let removed = cache.invalidate(&event.target);
                requests.reset_throttle_matching(&event.target);
                info!(pattern = %event.target, removed, "Purged invalidated cache entries");
            })
        };
        *mutex_lock(&inner.purge, SOURCE, "build") = Some(purge);

        SyncCoordinator { inner }
    }
}

impl SyncCoordinator {
    pub fn builder(config: SyncConfig) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            config,
            medium: None,
            transport: None,
        }
    }

    /// Memory-only instance with an unconnected loopback transport.
    pub fn create(config: SyncConfig) -> Self {
        Self::builder(config).build()
    }

    /// Build an instance from loaded settings, opening the configured
    /// storage medium.
    pub fn from_settings(settings: &Settings, transport: Arc<dyn Transport>) -> Result<Self, InfraError> {
        let medium: Arc<dyn PersistentMedium> = match &settings.storage.path {
            Some(path) => Arc::new(SqliteMedium::open(path)?),
            None => Arc::new(MemoryMedium::new()),
        };
        Ok(Self::builder(SyncConfig::from(settings))
            .medium(medium)
            .transport(transport)
            .build())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn requests(&self) -> &RequestCoordinator {
        &self.inner.requests
    }

    pub fn channels(&self) -> &SubscriptionMultiplexer {
        &self.inner.channels
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.inner.bus
    }

    /// Bind `key` to `fetch` and return a live view of it.
    ///
    /// A cached entry is surfaced before this returns, even when stale; a
    /// stale or absent entry schedules a fetch in the background.
    pub fn use_synchronized_resource<V, F, Fut, E>(
        &self,
        key: impl Into<String>,
        fetch: F,
        options: ResourceOptions,
    ) -> SynchronizedResource<V>
    where
        V: CacheValue,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = key.into();
        let fetch: FetchFn<V> = Arc::new(move || {
            let request = fetch();
            async move { request.await.map_err(Into::<BoxError>::into) }.boxed()
        });

        let mut set_options = SetOptions::default()
            .with_priority(options.priority)
            .with_tier(options.tier);
        set_options.expiry = options.expiry;

        let (state, _) = watch::channel(ResourceSnapshot::default());
        let core = Arc::new(ResourceCore {
            key: key.clone(),
            fetch,
            priority: options.priority,
            throttle: options
                .throttle
                .or_else(|| self.inner.config.throttle_for(options.class)),
            set_options,
            invalidation_kinds: options.invalidation_kinds,
            cache: Arc::clone(&self.inner.cache),
            requests: self.inner.requests.clone(),
            bus: self.inner.bus.clone(),
            state,
            disposed: AtomicBool::new(self.is_disposed()),
            checks: AtomicU64::new(0),
        });

        if self.is_disposed() {
            debug!(key = %key, "Coordinator disposed; resource will not subscribe");
            return SynchronizedResource {
                core,
                bus_subscription: None,
                channel: None,
            };
        }

        let bus_subscription = Some(self.inner.bus.on(KindMatcher::Any, weak_handler(&core)));
        let channel = options.channel_key.map(|channel_key| {
            let weak = Arc::downgrade(&core);
            self.inner.channels.subscribe(channel_key, move |_event| {
                if let Some(core) = weak.upgrade() {
                    core.revalidate(Revalidate::Push);
                }
            })
        });

        core.revalidate(Revalidate::Check);

        SynchronizedResource {
            core,
            bus_subscription,
            channel,
        }
    }

    /// Emit an event on this instance's bus.
    pub fn emit(&self, event: InvalidationEvent) {
        self.inner.bus.emit(event);
    }

    /// Purge cache entries and throttle windows matching `pattern`, then
    /// notify every resource so matching ones re-fetch.
    pub fn invalidate(&self, pattern: KeyPattern) {
        self.emit(InvalidationEvent::invalidated(pattern));
    }

    /// The application came back to the foreground; every resource
    /// re-checks its staleness.
    pub fn notify_foreground(&self) {
        self.emit(InvalidationEvent::foreground_resumed());
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Tear the instance down: close every channel, drop every bus handler
    /// and forget pending requests. Cached entries are kept.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(purge) = mutex_lock(&self.inner.purge, SOURCE, "dispose").take() {
            purge.unsubscribe();
        }
        self.inner.channels.shutdown();
        self.inner.bus.clear();
        self.inner.requests.clear();
        info!("Sync coordinator disposed");
    }
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            warn!("Sync coordinator dropped without dispose; closing channels");
            self.channels.shutdown();
        }
    }
}
