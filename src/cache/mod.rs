//! Stale-while-revalidate cache.
//!
//! Lookups are instantaneous and never perform I/O; a present entry is
//! returned even when stale so callers can render it while a refresh runs.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! memory_max_entries = 1024
//! persistent_max_entries = 256
//! default_expiry_ms = 300000
//! high_priority_expiry_ms = 3600000
//! ```

mod config;
mod entry;
mod keys;
mod store;

pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheValue, EntryMeta, Priority, SetOptions, Tier};
pub use keys::KeyPattern;
pub use store::{CacheStats, CacheStore, inspect_record};
