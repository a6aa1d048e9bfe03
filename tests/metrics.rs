use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serial_test::serial;
use syncstate::bus::{InvalidationBus, InvalidationEvent, KindMatcher};
use syncstate::cache::{CacheConfig, CacheStore, SetOptions};
use syncstate::coordinator::{BoxError, RequestCoordinator, ScheduleOptions};
use syncstate::infra::telemetry;
use syncstate::multiplexer::{ChannelConfig, ChannelKey, LoopbackTransport, SubscriptionMultiplexer};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn recorded_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

fn assert_recorded(expected: &[&str]) {
    let names = recorded_names();
    for metric in expected {
        assert!(names.contains(*metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn cache_and_fetch_paths_emit_expected_metric_keys() {
    snapshotter();

    let store = CacheStore::new(CacheConfig {
        memory_max_entries: 1,
        ..Default::default()
    });
    assert!(store.get::<u32>("first").is_none());
    store.set("first", 1u32, SetOptions::default());
    assert!(store.get::<u32>("first").is_some());
    store.set("second", 2u32, SetOptions::default());

    let requests = RequestCoordinator::default();
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<u32, BoxError>(1)
    };
    let throttled = ScheduleOptions::default().with_throttle(Duration::from_secs(60));
    let (a, b) = tokio::join!(
        requests.schedule("ratings", slow, throttled),
        requests.schedule("ratings", slow, throttled),
    );
    assert_eq!(a.expect("first caller"), 1);
    assert_eq!(b.expect("joined caller"), 1);
    assert!(
        requests
            .schedule("ratings", slow, throttled)
            .await
            .is_err_and(|err| err.is_throttled())
    );
    assert!(
        requests
            .schedule("broken", || async { Err::<u32, _>("boom") }, ScheduleOptions::default())
            .await
            .is_err()
    );

    assert_recorded(&[
        "syncstate_cache_hit_total",
        "syncstate_cache_miss_total",
        "syncstate_cache_evict_total",
        "syncstate_fetch_started_total",
        "syncstate_fetch_deduped_total",
        "syncstate_fetch_throttled_total",
        "syncstate_fetch_failed_total",
        "syncstate_fetch_ms",
    ]);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn channel_and_bus_paths_emit_expected_metric_keys() {
    snapshotter();

    let transport = Arc::new(LoopbackTransport::new());
    transport.fail_next_opens(1);
    let mux = SubscriptionMultiplexer::new(transport.clone(), ChannelConfig::default());
    let flaky = mux.subscribe(ChannelKey::new("orders"), |_| {});
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(transport.is_connected(&ChannelKey::new("orders")));

    transport.set_reachable(false);
    let dead = mux.subscribe(ChannelKey::new("ratings"), |_| {});
    tokio::time::sleep(Duration::from_secs(20)).await;

    let bus = InvalidationBus::new();
    let _bad = bus.on(KindMatcher::Any, |_| panic!("handler bug"));
    bus.emit(InvalidationEvent::foreground_resumed());

    assert_recorded(&[
        "syncstate_channel_open_total",
        "syncstate_channel_reconnect_total",
        "syncstate_channel_polling_total",
        "syncstate_channels_active",
        "syncstate_bus_handler_error_total",
    ]);

    drop(flaky);
    drop(dead);
    mux.shutdown();
}
