//! Metric names emitted through the `metrics` facade.

pub const CACHE_HIT: &str = "syncstate_cache_hit_total";
pub const CACHE_MISS: &str = "syncstate_cache_miss_total";
pub const CACHE_EVICT: &str = "syncstate_cache_evict_total";
pub const STORAGE_ERROR: &str = "syncstate_storage_error_total";

pub const FETCH_STARTED: &str = "syncstate_fetch_started_total";
pub const FETCH_DEDUPED: &str = "syncstate_fetch_deduped_total";
pub const FETCH_THROTTLED: &str = "syncstate_fetch_throttled_total";
pub const FETCH_FAILED: &str = "syncstate_fetch_failed_total";
pub const FETCH_MS: &str = "syncstate_fetch_ms";

pub const CHANNEL_OPEN: &str = "syncstate_channel_open_total";
pub const CHANNEL_RECONNECT: &str = "syncstate_channel_reconnect_total";
pub const CHANNEL_POLLING: &str = "syncstate_channel_polling_total";
pub const CHANNELS_ACTIVE: &str = "syncstate_channels_active";

pub const BUS_HANDLER_ERROR: &str = "syncstate_bus_handler_error_total";
