//! Two-tier cache storage.
//!
//! Entries are kept type-erased in one of two LRU lists: memory-only entries
//! and entries mirrored to a [`PersistentMedium`]. Both lists are ordered by
//! set time (lookups use `peek`), so overflow evicts the least-recently-set
//! entry of its tier class. Medium I/O happens outside the lock and never
//! fails a cache operation.

use std::any::{Any, type_name};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::infra::storage::{PersistentMedium, StorageError};
use crate::metrics_keys::{CACHE_EVICT, CACHE_HIT, CACHE_MISS, STORAGE_ERROR};
use crate::util::lock::{rw_read, rw_write};

use super::config::CacheConfig;
use super::entry::{CacheEntry, CacheValue, EntryMeta, Priority, SetOptions, Tier};
use super::keys::KeyPattern;

const SOURCE: &str = "cache::store";

enum Payload {
    Decoded(Arc<dyn Any + Send + Sync>),
    /// Rehydrated from the medium; decoded on the first typed lookup.
    Encoded(serde_json::Value),
}

struct Slot {
    payload: Payload,
    meta: EntryMeta,
}

impl Slot {
    fn typed<V: CacheValue>(&mut self, key: &str) -> Option<V> {
        let decoded = match &self.payload {
            Payload::Decoded(any) => {
                let value = any.downcast_ref::<V>().cloned();
                if value.is_none() {
                    warn!(
                        key,
                        expected = type_name::<V>(),
                        "Cached value has a different type; treating as miss"
                    );
                }
                return value;
            }
            Payload::Encoded(json) => serde_json::from_value::<V>(json.clone()),
        };

        match decoded {
            Ok(value) => {
                self.payload = Payload::Decoded(Arc::new(value.clone()));
                Some(value)
            }
            Err(err) => {
                warn!(
                    key,
                    expected = type_name::<V>(),
                    error = %err,
                    "Failed to decode rehydrated cache value; treating as miss"
                );
                None
            }
        }
    }
}

struct Tiers {
    memory: LruCache<String, Slot>,
    mirrored: LruCache<String, Slot>,
}

impl Tiers {
    fn new() -> Self {
        Self {
            memory: LruCache::unbounded(),
            mirrored: LruCache::unbounded(),
        }
    }

    fn peek(&self, key: &str) -> Option<&Slot> {
        self.memory.peek(key).or_else(|| self.mirrored.peek(key))
    }

    fn peek_mut(&mut self, key: &str) -> Option<&mut Slot> {
        if self.memory.contains(key) {
            self.memory.peek_mut(key)
        } else {
            self.mirrored.peek_mut(key)
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        self.memory.pop(key).or_else(|| self.mirrored.pop(key))
    }

    fn len(&self) -> usize {
        self.memory.len() + self.mirrored.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Slot)> {
        self.mirrored.iter().rev().chain(self.memory.iter().rev())
    }

    /// Insert a slot into its tier class and evict overflow, returning the
    /// evicted keys with their metadata.
    fn insert(&mut self, key: String, slot: Slot, config: &CacheConfig) -> Vec<(String, EntryMeta)> {
        if slot.meta.tier.is_mirrored() {
            self.mirrored.put(key, slot);
            evict_overflow(&mut self.mirrored, config.persistent_limit_non_zero().get())
        } else {
            self.memory.put(key, slot);
            evict_overflow(&mut self.memory, config.memory_limit_non_zero().get())
        }
    }

    fn drain_matching(
        &mut self,
        mut predicate: impl FnMut(&str, &EntryMeta) -> bool,
    ) -> Vec<(String, EntryMeta)> {
        let keys: Vec<String> = self
            .iter()
            .filter(|(key, slot)| predicate(key, &slot.meta))
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|slot| (key, slot.meta)))
            .collect()
    }
}

/// Pop least-recently-set entries until `list` fits in `limit`, skipping
/// high-priority entries.
fn evict_overflow(list: &mut LruCache<String, Slot>, limit: usize) -> Vec<(String, EntryMeta)> {
    let mut evicted = Vec::new();
    while list.len() > limit {
        let victim = list
            .iter()
            .rev()
            .find(|(_, slot)| slot.meta.priority != Priority::High)
            .map(|(key, _)| key.clone());
        let Some(key) = victim else {
            break;
        };
        if let Some(slot) = list.pop(&key) {
            evicted.push((key, slot.meta));
        }
    }
    evicted
}

/// Point-in-time counters for the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub persisted: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Stale-while-revalidate cache store.
///
/// `get` is a pure lookup: it returns any present entry, stale or not, and
/// leaves the staleness decision to the caller.
pub struct CacheStore {
    config: CacheConfig,
    tiers: RwLock<Tiers>,
    medium: Option<Arc<dyn PersistentMedium>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Memory-only store; persistent entries are kept in memory but not mirrored.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            tiers: RwLock::new(Tiers::new()),
            medium: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Store backed by `medium`, rehydrating every readable record.
    pub fn with_medium(config: CacheConfig, medium: Arc<dyn PersistentMedium>) -> Self {
        let mut store = Self::new(config);
        store.medium = Some(medium);
        store.rehydrate();
        store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn rehydrate(&self) {
        let Some(medium) = self.medium.as_ref() else {
            return;
        };

        let records = match medium.load_all() {
            Ok(records) => records,
            Err(err) => {
                report_storage_error("load_all", None, &err);
                return;
            }
        };

        let mut decoded: Vec<(String, Slot)> = records
            .into_iter()
            .filter_map(|(key, bytes)| match PersistedRecord::decode(&key, &bytes) {
                Ok(record) => Some((key, record.into_slot())),
                Err(err) => {
                    report_storage_error("rehydrate", Some(&key), &err);
                    None
                }
            })
            .collect();
        decoded.sort_by_key(|(_, slot)| slot.meta.stored_at);

        let restored = decoded.len();
        let evicted = {
            let mut tiers = rw_write(&self.tiers, SOURCE, "rehydrate");
            for (key, slot) in decoded {
                tiers.mirrored.put(key, slot);
            }
            evict_overflow(
                &mut tiers.mirrored,
                self.config.persistent_limit_non_zero().get(),
            )
        };
        self.forget_evicted(&evicted);

        debug!(
            restored,
            evicted = evicted.len(),
            "Rehydrated cache from persistent medium"
        );
    }

    /// Look up `key` as a `V`. Stale entries are returned.
    pub fn get<V: CacheValue>(&self, key: &str) -> Option<CacheEntry<V>> {
        let entry = {
            let mut tiers = rw_write(&self.tiers, SOURCE, "get");
            tiers.peek_mut(key).and_then(|slot| {
                let meta = slot.meta;
                slot.typed::<V>(key)
                    .map(|value| CacheEntry::from_parts(key, value, meta))
            })
        };

        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(CACHE_HIT).increment(1);
            debug!(key, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(CACHE_MISS).increment(1);
        }
        entry
    }

    /// Metadata of the entry under `key`, regardless of its payload type.
    pub fn meta(&self, key: &str) -> Option<EntryMeta> {
        rw_read(&self.tiers, SOURCE, "meta")
            .peek(key)
            .map(|slot| slot.meta)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.meta(key).is_some()
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set<V: CacheValue>(&self, key: &str, value: V, options: SetOptions) {
        let meta = EntryMeta {
            stored_at: OffsetDateTime::now_utc(),
            expiry: options
                .expiry
                .unwrap_or_else(|| self.config.default_expiry(options.priority)),
            priority: options.priority,
            tier: options.tier,
        };

        let encoded = match (&self.medium, meta.tier.is_mirrored()) {
            (Some(_), true) => match PersistedRecord::encode(key, &value, meta) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    report_storage_error("encode", Some(key), &err);
                    None
                }
            },
            _ => None,
        };

        let slot = Slot {
            payload: Payload::Decoded(Arc::new(value)),
            meta,
        };

        let (previous, evicted) = {
            let mut tiers = rw_write(&self.tiers, SOURCE, "set");
            let previous = tiers.remove(key).map(|slot| slot.meta);
            let evicted = tiers.insert(key.to_string(), slot, &self.config);
            (previous, evicted)
        };

        if let Some(medium) = self.medium.as_ref() {
            if let Some(bytes) = encoded {
                if let Err(err) = medium.set(key, &bytes) {
                    report_storage_error("set", Some(key), &err);
                }
            } else if previous.is_some_and(|prev| prev.tier.is_mirrored()) {
                // Moved out of the persistent tier, or failed to encode.
                if let Err(err) = medium.remove(key) {
                    report_storage_error("remove", Some(key), &err);
                }
            }
        }

        self.forget_evicted(&evicted);
    }

    /// Remove every entry matching `pattern`. Returns how many were removed.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        self.invalidate_where(|key, _| pattern.matches(key))
    }

    /// Remove every entry for which `predicate` returns true.
    pub fn invalidate_where(&self, predicate: impl FnMut(&str, &EntryMeta) -> bool) -> usize {
        let removed = rw_write(&self.tiers, SOURCE, "invalidate_where").drain_matching(predicate);
        self.forget_mirrored(&removed);
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Invalidated cache entries");
        }
        removed.len()
    }

    /// Drop entries that have been stale for longer than `grace`.
    pub fn purge_expired(&self, grace: Duration) -> usize {
        let now = OffsetDateTime::now_utc();
        self.invalidate_where(|_, meta| meta.age_at(now) > meta.expiry.saturating_add(grace))
    }

    /// Remove every entry, including mirrored records.
    pub fn clear(&self) {
        self.invalidate(&KeyPattern::All);
    }

    /// Keys currently cached, mirrored entries first, each class oldest first.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.tiers, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, EntryMeta)> {
        rw_read(&self.tiers, SOURCE, "entries")
            .iter()
            .map(|(key, slot)| (key.clone(), slot.meta))
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.tiers, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = rw_read(&self.tiers, SOURCE, "stats");
        CacheStats {
            entries: tiers.len(),
            persisted: tiers.mirrored.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn forget_evicted(&self, evicted: &[(String, EntryMeta)]) {
        if evicted.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        counter!(CACHE_EVICT).increment(evicted.len() as u64);
        for (key, meta) in evicted {
            debug!(key = %key, tier = ?meta.tier, "Evicted least-recently-set cache entry");
        }
        self.forget_mirrored(evicted);
    }

    fn forget_mirrored(&self, removed: &[(String, EntryMeta)]) {
        let Some(medium) = self.medium.as_ref() else {
            return;
        };
        for (key, _) in removed.iter().filter(|(_, meta)| meta.tier.is_mirrored()) {
            if let Err(err) = medium.remove(key) {
                report_storage_error("remove", Some(key), &err);
            }
        }
    }
}

fn report_storage_error(op: &'static str, key: Option<&str>, err: &StorageError) {
    counter!(STORAGE_ERROR).increment(1);
    warn!(op, key, error = %err, "Persistent cache medium failed; continuing in memory");
}

/// On-medium representation of a mirrored entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    value: serde_json::Value,
    stored_at_ms: i64,
    expiry_ms: u64,
    priority: Priority,
    tier: Tier,
}

impl PersistedRecord {
    fn encode<V: CacheValue>(key: &str, value: &V, meta: EntryMeta) -> Result<Vec<u8>, StorageError> {
        let encode_error = |err: serde_json::Error| StorageError::Encode {
            key: key.to_string(),
            message: err.to_string(),
        };
        let record = Self {
            value: serde_json::to_value(value).map_err(encode_error)?,
            stored_at_ms: (meta.stored_at.unix_timestamp_nanos() / 1_000_000) as i64,
            expiry_ms: u64::try_from(meta.expiry.as_millis()).unwrap_or(u64::MAX),
            priority: meta.priority,
            tier: meta.tier,
        };
        serde_json::to_vec(&record).map_err(encode_error)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|err| StorageError::Decode {
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    fn meta(&self) -> EntryMeta {
        let stored_at =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.stored_at_ms) * 1_000_000)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        EntryMeta {
            stored_at,
            expiry: Duration::from_millis(self.expiry_ms),
            priority: self.priority,
            // Only mirrored entries are ever written.
            tier: if self.tier.is_mirrored() {
                self.tier
            } else {
                Tier::Persistent
            },
        }
    }

    fn into_slot(self) -> Slot {
        let meta = self.meta();
        Slot {
            payload: Payload::Encoded(self.value),
            meta,
        }
    }
}

/// Decode the metadata of a persisted record without touching its payload.
pub fn inspect_record(key: &str, bytes: &[u8]) -> Result<EntryMeta, StorageError> {
    PersistedRecord::decode(key, bytes).map(|record| record.meta())
}
