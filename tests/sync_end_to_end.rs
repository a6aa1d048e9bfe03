use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncstate::cache::KeyPattern;
use syncstate::coordinator::BoxError;
use syncstate::multiplexer::{ChannelKey, ChannelMode, LoopbackTransport};
use syncstate::{ResourceClass, ResourceOptions, SyncConfig, SyncCoordinator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Category {
    id: u32,
    name: String,
}

/// Fetch function returning a category list whose names carry the call number.
fn categories_api(
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Vec<Category>, BoxError>> + Send + Sync + 'static
{
    use futures::FutureExt;

    let calls = Arc::clone(calls);
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(vec![
                Category {
                    id: 1,
                    name: format!("Shoes v{n}"),
                },
                Category {
                    id: 2,
                    name: format!("Bags v{n}"),
                },
            ])
        }
        .boxed()
    }
}

fn names(categories: Option<Vec<Category>>) -> Vec<String> {
    categories
        .unwrap_or_default()
        .into_iter()
        .map(|category| category.name)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn categories_are_fetched_once_and_refreshed_by_pushes() {
    let transport = Arc::new(LoopbackTransport::new());
    let sync = SyncCoordinator::builder(SyncConfig::default())
        .transport(transport.clone())
        .build();
    let calls = Arc::new(AtomicUsize::new(0));
    let channel = ChannelKey::new("categories");
    let options = ResourceOptions::default()
        .with_class(ResourceClass::Reference)
        .with_channel(channel.clone());

    let menu = sync.use_synchronized_resource("categories", categories_api(&calls), options.clone());
    let filter = sync.use_synchronized_resource("categories", categories_api(&calls), options);

    let initial = menu.snapshot();
    assert!(initial.loading);
    assert!(initial.value.is_none());

    let mut updates = filter.watch();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(names(menu.value()), vec!["Shoes v1", "Bags v1"]);
    assert_eq!(names(filter.value()), vec!["Shoes v1", "Bags v1"]);
    assert!(updates.has_changed().expect("sender alive"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(transport.publish(&channel, r#"{"type":"categories_changed"}"#));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(names(menu.value()), vec!["Shoes v2", "Bags v2"]);
    assert_eq!(names(filter.value()), vec!["Shoes v2", "Bags v2"]);
    assert_eq!(transport.opens(&channel), 1);

    menu.dispose();
    assert_eq!(
        sync.channels().status(&channel).map(|status| status.ref_count),
        Some(1)
    );
    filter.dispose();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(sync.channels().channel_count(), 0);
    assert!(!transport.is_connected(&channel));

    sync.dispose();
}

#[tokio::test(start_paused = true)]
async fn unreachable_push_service_degrades_to_polling_refreshes() {
    let transport = Arc::new(LoopbackTransport::new());
    transport.set_reachable(false);
    let sync = SyncCoordinator::builder(SyncConfig::default())
        .transport(transport.clone())
        .build();
    let calls = Arc::new(AtomicUsize::new(0));
    let channel = ChannelKey::new("orders").with_filter("status", "open");

    let orders = sync.use_synchronized_resource(
        "orders?status=open",
        categories_api(&calls),
        ResourceOptions::default().with_channel(channel.clone()),
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    let status = sync.channels().status(&channel).expect("channel tracked");
    assert_eq!(status.mode, ChannelMode::Polling);
    assert_eq!(transport.opens(&channel), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(names(orders.value()), vec!["Shoes v2", "Bags v2"]);

    sync.dispose();
}

#[tokio::test(start_paused = true)]
async fn invalidation_purges_and_refetches_matching_resources() {
    let sync = SyncCoordinator::create(SyncConfig::default());
    let review_calls = Arc::new(AtomicUsize::new(0));
    let profile_calls = Arc::new(AtomicUsize::new(0));

    let reviews = sync.use_synchronized_resource(
        "reviews:42",
        categories_api(&review_calls),
        ResourceOptions::default(),
    );
    let profile = sync.use_synchronized_resource(
        "profile",
        categories_api(&profile_calls),
        ResourceOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    sync.invalidate(KeyPattern::prefix("reviews:"));
    let snapshot = reviews.snapshot();
    assert!(snapshot.validating);
    assert!(snapshot.value.is_some(), "last value stays visible");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(review_calls.load(Ordering::SeqCst), 2);
    assert_eq!(profile_calls.load(Ordering::SeqCst), 1);
    assert_eq!(names(reviews.value()), vec!["Shoes v2", "Bags v2"]);
    assert_eq!(names(profile.value()), vec!["Shoes v1", "Bags v1"]);

    sync.dispose();
}

#[tokio::test(start_paused = true)]
async fn independent_coordinators_share_nothing() {
    let first = SyncCoordinator::create(SyncConfig::default());
    let second = SyncCoordinator::create(SyncConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let a = first.use_synchronized_resource("categories", categories_api(&calls), ResourceOptions::default());
    let b = second.use_synchronized_resource("categories", categories_api(&calls), ResourceOptions::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(a.value().is_some());
    assert!(b.value().is_some());

    first.invalidate(KeyPattern::All);
    assert!(!first.cache().contains("categories"));
    assert!(second.cache().contains("categories"));

    first.dispose();
    second.dispose();
}
