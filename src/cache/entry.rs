//! Cache entry model.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

/// Payload types that can live in the cache.
///
/// Values must be serializable so the persistent tier can mirror them; they
/// are cloned out on every lookup, so large payloads should be wrapped in an
/// `Arc` by the caller.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Eviction and expiry class of an entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    /// Slowly-changing reference data: never evicted, longer default expiry.
    High,
}

/// Where an entry is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Process memory only; gone after restart.
    #[default]
    Memory,
    /// Mirrored to the persistent medium and rehydrated at startup.
    Persistent,
    /// Same as `Persistent`: lookups never perform I/O, so every mirrored
    /// entry also keeps its in-memory copy.
    Both,
}

impl Tier {
    pub fn is_mirrored(self) -> bool {
        matches!(self, Self::Persistent | Self::Both)
    }
}

/// Options accepted by [`CacheStore::set`](super::CacheStore::set).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Freshness window; `None` picks the configured default for the priority.
    pub expiry: Option<Duration>,
    pub priority: Priority,
    pub tier: Tier,
}

impl SetOptions {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

/// Bookkeeping shared by every entry regardless of payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub stored_at: OffsetDateTime,
    pub expiry: Duration,
    pub priority: Priority,
    pub tier: Tier,
}

impl EntryMeta {
    /// Time elapsed since the entry was stored; zero if the clock went backwards.
    pub fn age_at(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.stored_at).unwrap_or(Duration::ZERO)
    }

    /// `now - stored_at > expiry`. A zero expiry is always stale.
    pub fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_zero() || self.age_at(now) > self.expiry
    }
}

/// A typed cache entry as returned by a lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub stored_at: OffsetDateTime,
    pub expiry: Duration,
    pub priority: Priority,
    pub tier: Tier,
}

impl<V> CacheEntry<V> {
    pub(crate) fn from_parts(key: &str, value: V, meta: EntryMeta) -> Self {
        Self {
            key: key.to_string(),
            value,
            stored_at: meta.stored_at,
            expiry: meta.expiry,
            priority: meta.priority,
            tier: meta.tier,
        }
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            stored_at: self.stored_at,
            expiry: self.expiry,
            priority: self.priority,
            tier: self.tier,
        }
    }

    pub fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        self.meta().is_stale_at(now)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(OffsetDateTime::now_utc())
    }
}
