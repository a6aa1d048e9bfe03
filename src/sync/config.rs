//! Runtime configuration of a [`SyncCoordinator`](super::SyncCoordinator).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::config::{
    DEFAULT_COUNTER_THROTTLE_MS, DEFAULT_MAX_CONCURRENT, DEFAULT_REFERENCE_THROTTLE_MS, Settings,
};
use crate::multiplexer::ChannelConfig;

/// Throttle preset of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Slowly-changing reference data such as category lists.
    Reference,
    /// Server-side counters; refreshed at most every counter window.
    Counter,
    /// No throttle.
    #[default]
    Standard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    /// Global cap on concurrently running fetches.
    pub max_concurrent: usize,
    pub reference_throttle: Duration,
    pub counter_throttle: Duration,
    pub channels: ChannelConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            reference_throttle: Duration::from_millis(DEFAULT_REFERENCE_THROTTLE_MS),
            counter_throttle: Duration::from_millis(DEFAULT_COUNTER_THROTTLE_MS),
            channels: ChannelConfig::default(),
        }
    }
}

impl From<&Settings> for SyncConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            cache: CacheConfig::from(&settings.cache),
            max_concurrent: settings.requests.max_concurrent.get(),
            reference_throttle: settings.requests.reference_throttle,
            counter_throttle: settings.requests.counter_throttle,
            channels: ChannelConfig::from(&settings.channels),
        }
    }
}

impl SyncConfig {
    /// Default throttle window for a resource class.
    pub fn throttle_for(&self, class: ResourceClass) -> Option<Duration> {
        match class {
            ResourceClass::Reference => Some(self.reference_throttle),
            ResourceClass::Counter => Some(self.counter_throttle),
            ResourceClass::Standard => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_presets() {
        let config = SyncConfig::default();
        assert_eq!(
            config.throttle_for(ResourceClass::Reference),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            config.throttle_for(ResourceClass::Counter),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.throttle_for(ResourceClass::Standard), None);
        assert_eq!(config.max_concurrent, 4);
    }
}
