//! Invalidation events and kind matching.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::KeyPattern;

/// Well-known event kinds shared by every feature module.
pub mod kinds {
    /// A resource was re-fetched and its cache entry replaced.
    pub const REFRESH: &str = "refresh";
    /// Cache entries were purged and must be re-read.
    pub const CACHE_INVALIDATED: &str = "cache_invalidated";
    /// Server-side counters changed.
    pub const COUNTERS_UPDATED: &str = "counters_updated";
    /// The application returned to the foreground.
    pub const FOREGROUND_RESUMED: &str = "foreground_resumed";
}

/// Monotonic emit order within one bus.
pub type Epoch = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    /// Assigned by the bus on emit.
    pub epoch: Epoch,
    pub target: KeyPattern,
    pub kind: String,
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(kind: impl Into<String>, target: KeyPattern) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch: 0,
            target,
            kind: kind.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// `REFRESH` for a single key.
    pub fn refresh(key: impl Into<String>) -> Self {
        Self::new(kinds::REFRESH, KeyPattern::Exact(key.into()))
    }

    /// `CACHE_INVALIDATED` for every key matching `target`.
    pub fn invalidated(target: KeyPattern) -> Self {
        Self::new(kinds::CACHE_INVALIDATED, target)
    }

    pub fn foreground_resumed() -> Self {
        Self::new(kinds::FOREGROUND_RESUMED, KeyPattern::All)
    }

    pub fn targets(&self, key: &str) -> bool {
        self.target.matches(key)
    }
}

/// Which event kinds a handler wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KindMatcher {
    Exact(String),
    Prefix(String),
    Contains(String),
    Any,
}

impl KindMatcher {
    pub fn exact(kind: impl Into<String>) -> Self {
        Self::Exact(kind.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        Self::Contains(fragment.into())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == kind,
            Self::Prefix(prefix) => kind.starts_with(prefix.as_str()),
            Self::Contains(fragment) => kind.contains(fragment.as_str()),
            Self::Any => true,
        }
    }
}

impl From<&str> for KindMatcher {
    fn from(kind: &str) -> Self {
        Self::Exact(kind.to_string())
    }
}
