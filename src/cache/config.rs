//! Cache configuration.
//!
//! Controls tier capacities and default freshness windows via `syncstate.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{
    DEFAULT_EXPIRY_MS, DEFAULT_HIGH_PRIORITY_EXPIRY_MS, DEFAULT_MEMORY_MAX_ENTRIES,
    DEFAULT_PERSISTENT_MAX_ENTRIES,
};

use super::entry::Priority;

/// Cache configuration from `syncstate.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum memory-only entries before least-recently-set eviction.
    pub memory_max_entries: usize,
    /// Maximum mirrored (persistent) entries before least-recently-set eviction.
    pub persistent_max_entries: usize,
    /// Default freshness window for low and normal priority entries.
    pub default_expiry_ms: u64,
    /// Default freshness window for high priority entries.
    pub high_priority_expiry_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            persistent_max_entries: DEFAULT_PERSISTENT_MAX_ENTRIES,
            default_expiry_ms: DEFAULT_EXPIRY_MS,
            high_priority_expiry_ms: DEFAULT_HIGH_PRIORITY_EXPIRY_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            memory_max_entries: settings.memory_max_entries.get(),
            persistent_max_entries: settings.persistent_max_entries.get(),
            default_expiry_ms: settings.default_expiry.as_millis() as u64,
            high_priority_expiry_ms: settings.high_priority_expiry.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// Default expiry for an entry stored without an explicit one.
    pub fn default_expiry(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => Duration::from_millis(self.high_priority_expiry_ms),
            Priority::Low | Priority::Normal => Duration::from_millis(self.default_expiry_ms),
        }
    }

    /// Returns the memory limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the persistent limit as NonZeroUsize, clamping to 1 if zero.
    pub fn persistent_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.persistent_max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
