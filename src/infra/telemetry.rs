use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::metrics_keys::*;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the layer emits.
///
/// Safe to call repeatedly; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(CACHE_HIT, Unit::Count, "Typed cache lookups that found an entry.");
        describe_counter!(CACHE_MISS, Unit::Count, "Typed cache lookups that found nothing.");
        describe_counter!(
            CACHE_EVICT,
            Unit::Count,
            "Cache entries evicted because a tier exceeded its capacity."
        );
        describe_counter!(
            STORAGE_ERROR,
            Unit::Count,
            "Persistent medium failures absorbed by the cache."
        );
        describe_counter!(FETCH_STARTED, Unit::Count, "Producer invocations started.");
        describe_counter!(
            FETCH_DEDUPED,
            Unit::Count,
            "Schedule calls that joined an in-flight request."
        );
        describe_counter!(
            FETCH_THROTTLED,
            Unit::Count,
            "Schedule calls answered from the throttle window."
        );
        describe_counter!(FETCH_FAILED, Unit::Count, "Producer invocations that failed.");
        describe_histogram!(
            FETCH_MS,
            Unit::Milliseconds,
            "Producer latency in milliseconds, including queueing for a slot."
        );
        describe_counter!(CHANNEL_OPEN, Unit::Count, "Transport channels opened.");
        describe_counter!(
            CHANNEL_RECONNECT,
            Unit::Count,
            "Reconnect attempts scheduled after transport errors."
        );
        describe_counter!(
            CHANNEL_POLLING,
            Unit::Count,
            "Channels degraded to polling after exhausting reconnects."
        );
        describe_gauge!(
            CHANNELS_ACTIVE,
            Unit::Count,
            "Channel keys with at least one subscriber."
        );
        describe_counter!(
            BUS_HANDLER_ERROR,
            Unit::Count,
            "Invalidation bus handlers that panicked during delivery."
        );
    });
}
