//! Client-side data synchronization: a stale-while-revalidate cache,
//! deduplicated and throttled fetches, multiplexed push channels and an
//! invalidation bus, tied together by [`SyncCoordinator`].

pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod infra;
pub mod metrics_keys;
pub mod multiplexer;
pub mod sync;
pub mod util;

pub use bus::{InvalidationBus, InvalidationEvent, KindMatcher};
pub use cache::{CacheEntry, CacheStore, KeyPattern, Priority, SetOptions, Tier};
pub use coordinator::{FetchError, RequestCoordinator, ScheduleOptions};
pub use multiplexer::{ChannelKey, PushEvent, SubscriptionMultiplexer, Transport};
pub use sync::{
    ResourceClass, ResourceOptions, ResourceSnapshot, SyncConfig, SyncCoordinator,
    SynchronizedResource,
};
