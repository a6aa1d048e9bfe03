//! In-flight request coordination.
//!
//! [`RequestCoordinator::schedule`] guarantees that a producer runs at most
//! once at a time per key: callers arriving while a fetch is pending join it.
//! Fetches run on spawned tasks behind a global concurrency cap, so dropping
//! every caller never cancels a shared fetch. Calls inside a key's throttle
//! window resolve with [`FetchError::Throttled`] and leave the answer to the
//! caller's cache.

mod error;
mod gate;
mod throttle;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{KeyPattern, Priority};
use crate::config::DEFAULT_MAX_CONCURRENT;
use crate::metrics_keys::{FETCH_DEDUPED, FETCH_FAILED, FETCH_MS, FETCH_STARTED, FETCH_THROTTLED};
use crate::util::isolate::panic_message;
use crate::util::lock::mutex_lock;

pub use error::{BoxError, FetchError};

use gate::PriorityGate;
use throttle::ThrottleTable;

const SOURCE: &str = "coordinator";

type AnyValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<AnyValue, FetchError>>>;

/// Per-call scheduling options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Position in the queue when the concurrency cap is reached.
    pub priority: Priority,
    /// Bypass the throttle window.
    pub force: bool,
    /// Minimum spacing between fetch starts for this key.
    pub throttle: Option<Duration>,
}

impl ScheduleOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }
}

struct PendingRequest {
    id: u64,
    created_at: Instant,
    fetch: SharedFetch,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingRequest>>,
    throttle: ThrottleTable,
    gate: PriorityGate,
    next_id: AtomicU64,
    runtime: Option<Handle>,
}

impl Inner {
    fn finish(&self, key: &str, id: u64) {
        let mut pending = mutex_lock(&self.pending, SOURCE, "finish");
        if pending.get(key).is_some_and(|request| request.id == id) {
            pending.remove(key);
        }
    }
}

/// Deduplicating, throttling and rate-capping front for fetch producers.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl RequestCoordinator {
    /// Create a coordinator allowing `max_concurrent` producers at once.
    ///
    /// Producers are spawned on the runtime current at construction, or on
    /// the caller's runtime when constructed outside one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                throttle: ThrottleTable::default(),
                gate: PriorityGate::new(max_concurrent),
                next_id: AtomicU64::new(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.inner.runtime {
            Some(runtime) => runtime.spawn(future),
            None => tokio::spawn(future),
        }
    }

    /// Schedule `producer` for `key`, or join the request already pending.
    ///
    /// Registration happens before this returns, so two calls made back to
    /// back share one producer invocation.
    pub fn schedule<V, F, Fut, E>(
        &self,
        key: impl Into<String>,
        producer: F,
        options: ScheduleOptions,
    ) -> BoxFuture<'static, Result<V, FetchError>>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = key.into();
        let mut pending = mutex_lock(&self.inner.pending, SOURCE, "schedule");

        if let Some(request) = pending.get(&key) {
            counter!(FETCH_DEDUPED).increment(1);
            debug!(
                key = %key,
                pending_ms = request.created_at.elapsed().as_millis() as u64,
                "Joined in-flight request"
            );
            return typed(key, request.fetch.clone());
        }

        if !options.force
            && let Some(window) = options.throttle
            && let Some(remaining) = self.inner.throttle.remaining(&key, window)
        {
            counter!(FETCH_THROTTLED).increment(1);
            debug!(
                key = %key,
                remaining_ms = remaining.as_millis() as u64,
                "Throttled; producer not invoked"
            );
            return futures::future::ready(Err(FetchError::throttled(&key, remaining))).boxed();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch = self.spawn_fetch(key.clone(), id, producer, options.priority);
        pending.insert(
            key.clone(),
            PendingRequest {
                id,
                created_at: Instant::now(),
                fetch: fetch.clone(),
            },
        );
        drop(pending);

        typed(key, fetch)
    }

    fn spawn_fetch<V, F, Fut, E>(&self, key: String, id: u64, producer: F, priority: Priority) -> SharedFetch
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = self.spawn(async move {
            let key = task_key;
            let queued_at = Instant::now();
            let permit = inner.gate.acquire(priority).await;
            let started_at = Instant::now();
            counter!(FETCH_STARTED).increment(1);

            let result = std::panic::AssertUnwindSafe(async move { producer().await })
                .catch_unwind()
                .await;
            drop(permit);
            histogram!(FETCH_MS).record(queued_at.elapsed().as_secs_f64() * 1000.0);

            let outcome = match result {
                Ok(Ok(value)) => {
                    inner.throttle.record(&key, started_at);
                    Ok(Arc::new(value) as AnyValue)
                }
                Ok(Err(err)) => {
                    let err = FetchError::producer(&key, err);
                    counter!(FETCH_FAILED).increment(1);
                    warn!(key = %key, error = %err, "Fetch failed");
                    Err(err)
                }
                Err(payload) => {
                    counter!(FETCH_FAILED).increment(1);
                    let message = panic_message(payload);
                    warn!(key = %key, panic = %message, "Fetch producer panicked");
                    Err(FetchError::aborted(&key, message))
                }
            };

            // Callers resolve only after the request is gone.
            inner.finish(&key, id);
            outcome
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    inner.finish(&key, id);
                    Err(FetchError::aborted(&key, err.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Forget the throttle window of `key`. Returns whether one was recorded.
    pub fn reset_throttle(&self, key: &str) -> bool {
        self.inner.throttle.reset(key)
    }

    /// Forget the throttle windows of every key matching `pattern`.
    pub fn reset_throttle_matching(&self, pattern: &KeyPattern) {
        self.inner.throttle.reset_where(|key| pattern.matches(key));
    }

    pub fn pending_count(&self) -> usize {
        mutex_lock(&self.inner.pending, SOURCE, "pending_count").len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        mutex_lock(&self.inner.pending, SOURCE, "is_pending").contains_key(key)
    }

    /// Producers currently holding a concurrency slot.
    pub fn running_count(&self) -> usize {
        self.inner.gate.running()
    }

    /// Drop every pending registration and throttle window.
    ///
    /// Running producers still complete; later calls start fresh fetches.
    pub fn clear(&self) {
        mutex_lock(&self.inner.pending, SOURCE, "clear").clear();
        self.inner.throttle.clear();
    }
}

fn typed<V>(key: String, fetch: SharedFetch) -> BoxFuture<'static, Result<V, FetchError>>
where
    V: Clone + Send + Sync + 'static,
{
    async move {
        let value = fetch.await?;
        value
            .downcast_ref::<V>()
            .cloned()
            .ok_or(FetchError::TypeMismatch { key })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;

    fn counting_producer(
        calls: &Arc<AtomicUsize>,
        value: u32,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, BoxError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_producer_invocation() {
        let coordinator = RequestCoordinator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = coordinator.schedule(
            "categories",
            counting_producer(&calls, 1, Duration::from_millis(100)),
            ScheduleOptions::default(),
        );
        let second = coordinator.schedule(
            "categories",
            counting_producer(&calls, 2, Duration::from_millis(100)),
            ScheduleOptions::default(),
        );
        assert!(coordinator.is_pending("categories"));

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.expect("first"), 1);
        assert_eq!(second.expect("second"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn failure_is_shared_and_clears_pending() {
        let coordinator = RequestCoordinator::default();
        let (release, gate) = oneshot::channel::<()>();

        let first = coordinator.schedule(
            "orders",
            move || async move {
                let _ = gate.await;
                Err::<u32, _>("upstream unavailable")
            },
            ScheduleOptions::default(),
        );
        let second = coordinator.schedule(
            "orders",
            || async { Ok::<u32, BoxError>(9) },
            ScheduleOptions::default(),
        );
        release.send(()).expect("release");

        let (first, second) = tokio::join!(first, second);
        let first = first.expect_err("first fails");
        let second = second.expect_err("second fails");
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(
            first.source_ref().map(ToString::to_string),
            Some("upstream unavailable".to_string())
        );
        assert!(!coordinator.is_pending("orders"));

        // A later call starts a new fetch.
        let value = coordinator
            .schedule(
                "orders",
                || async { Ok::<u32, BoxError>(3) },
                ScheduleOptions::default(),
            )
            .await
            .expect("retry");
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_inside_the_throttle_window_skip_the_producer() {
        let coordinator = RequestCoordinator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = ScheduleOptions::default().with_throttle(Duration::from_secs(5));

        let first = coordinator
            .schedule("ratings", counting_producer(&calls, 1, Duration::ZERO), options)
            .await
            .expect("first");
        assert_eq!(first, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let throttled = coordinator
            .schedule("ratings", counting_producer(&calls, 2, Duration::ZERO), options)
            .await
            .expect_err("throttled");
        assert!(matches!(
            throttled,
            FetchError::Throttled { remaining, .. } if remaining == Duration::from_secs(3)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let forced = coordinator
            .schedule("ratings", counting_producer(&calls, 3, Duration::ZERO), options.forced())
            .await
            .expect("forced");
        assert_eq!(forced, 3);

        tokio::time::advance(Duration::from_secs(6)).await;
        let refreshed = coordinator
            .schedule("ratings", counting_producer(&calls, 4, Duration::ZERO), options)
            .await
            .expect("after window");
        assert_eq!(refreshed, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_does_not_open_a_throttle_window() {
        let coordinator = RequestCoordinator::default();
        let options = ScheduleOptions::default().with_throttle(Duration::from_secs(30));

        let failed = coordinator
            .schedule("counters", || async { Err::<u32, _>("boom") }, options)
            .await;
        assert!(failed.is_err());

        let value = coordinator
            .schedule("counters", || async { Ok::<u32, BoxError>(12) }, options)
            .await
            .expect("second attempt runs");
        assert_eq!(value, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_callers_do_not_cancel_the_fetch() {
        let coordinator = RequestCoordinator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = ScheduleOptions::default().with_throttle(Duration::from_secs(60));

        drop(coordinator.schedule(
            "profile",
            counting_producer(&calls, 8, Duration::from_millis(50)),
            options,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_pending("profile"));
        let throttled = coordinator
            .schedule("profile", counting_producer(&calls, 9, Duration::ZERO), options)
            .await;
        assert!(throttled.is_err_and(|err| err.is_throttled()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_prefers_higher_priority() {
        let coordinator = RequestCoordinator::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |label: &'static str| {
            let order = Arc::clone(&order);
            move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().expect("order").push(label);
                Ok::<_, BoxError>(label)
            }
        };

        let blocker = coordinator.schedule("a", record("a"), ScheduleOptions::default());
        tokio::task::yield_now().await;
        let low = coordinator.schedule(
            "low",
            record("low"),
            ScheduleOptions::default().with_priority(Priority::Low),
        );
        tokio::task::yield_now().await;
        let high = coordinator.schedule(
            "high",
            record("high"),
            ScheduleOptions::default().with_priority(Priority::High),
        );

        let _ = tokio::join!(blocker, low, high);
        assert_eq!(*order.lock().expect("order"), vec!["a", "high", "low"]);
        assert_eq!(coordinator.running_count(), 0);
    }

    #[tokio::test]
    async fn panicking_producer_resolves_as_aborted() {
        let coordinator = RequestCoordinator::default();
        let result = coordinator
            .schedule(
                "broken",
                || async {
                    if true {
                        panic!("producer exploded");
                    }
                    Ok::<u32, BoxError>(0)
                },
                ScheduleOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(FetchError::Aborted { ref message, .. }) if message == "producer exploded"));
        assert!(!coordinator.is_pending("broken"));
    }

    #[tokio::test]
    async fn joining_with_another_type_is_a_mismatch() {
        let coordinator = RequestCoordinator::default();
        let (release, gate) = oneshot::channel::<()>();

        let first = coordinator.schedule(
            "mixed",
            move || async move {
                let _ = gate.await;
                Ok::<u32, BoxError>(1)
            },
            ScheduleOptions::default(),
        );
        let second = coordinator.schedule(
            "mixed",
            || async { Ok::<String, BoxError>("nope".into()) },
            ScheduleOptions::default(),
        );
        release.send(()).expect("release");

        assert_eq!(first.await.expect("first"), 1);
        assert!(matches!(second.await, Err(FetchError::TypeMismatch { .. })));
    }
}
