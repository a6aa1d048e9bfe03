//! Invalidation event bus.
//!
//! Delivery is synchronous and in registration order. An event emitted from
//! inside a handler (or concurrently from another thread) is queued and
//! delivered after the event being dispatched, so every handler observes
//! events in emit order.

mod events;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics_keys::BUS_HANDLER_ERROR;
use crate::util::isolate::run_isolated;
use crate::util::lock::mutex_lock;

pub use events::{Epoch, InvalidationEvent, KindMatcher, kinds};

const SOURCE: &str = "bus";

/// A handler panicked while an event was delivered to it.
#[derive(Debug, Clone, Error)]
#[error("bus handler {handler_id} panicked on `{kind}` event: {message}")]
pub struct HandlerError {
    pub handler_id: u64,
    pub kind: String,
    pub message: String,
}

type Handler = Arc<dyn Fn(&InvalidationEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    matcher: KindMatcher,
    active: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<InvalidationEvent>,
    active: bool,
}

#[derive(Default)]
struct BusInner {
    handlers: Mutex<Vec<HandlerEntry>>,
    dispatch: Mutex<Dispatch>,
    next_id: AtomicU64,
    epoch_counter: AtomicU64,
    handler_errors: AtomicU64,
}

impl BusInner {
    fn deliver(&self, event: &InvalidationEvent) {
        let matching: Vec<(u64, Arc<AtomicBool>, Handler)> =
            mutex_lock(&self.handlers, SOURCE, "deliver")
                .iter()
                .filter(|entry| entry.matcher.matches(&event.kind))
                .map(|entry| (entry.id, Arc::clone(&entry.active), Arc::clone(&entry.handler)))
                .collect();

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = %event.kind,
            pattern = %event.target,
            handlers = matching.len(),
            "Dispatching invalidation event"
        );

        for (handler_id, active, handler) in matching {
            // Unsubscribed earlier in this dispatch.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if let Err(message) = run_isolated(|| handler(event)) {
                let err = HandlerError {
                    handler_id,
                    kind: event.kind.clone(),
                    message,
                };
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                counter!(BUS_HANDLER_ERROR).increment(1);
                warn!(error = %err, event_id = %event.id, "Invalidation handler failed");
            }
        }
    }

    fn remove(&self, id: u64) {
        mutex_lock(&self.handlers, SOURCE, "remove").retain(|entry| entry.id != id);
    }
}

/// Publish/subscribe hub for invalidation events.
#[derive(Clone, Default)]
pub struct InvalidationBus {
    inner: Arc<BusInner>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event whose kind matches `matcher`.
    pub fn on<F>(&self, matcher: impl Into<KindMatcher>, handler: F) -> BusSubscription
    where
        F: Fn(&InvalidationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let handler: Handler = Arc::new(handler);

        mutex_lock(&self.inner.handlers, SOURCE, "on").push(HandlerEntry {
            id,
            matcher: matcher.into(),
            active: Arc::clone(&active),
            handler,
        });

        BusSubscription {
            id,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every matching handler.
    ///
    /// Returns once the event (and anything queued before it) has been
    /// delivered, unless another dispatch is already running, in which case
    /// the event is queued behind it.
    pub fn emit(&self, mut event: InvalidationEvent) {
        event.epoch = self.inner.epoch_counter.fetch_add(1, Ordering::SeqCst);
        {
            let mut dispatch = mutex_lock(&self.inner.dispatch, SOURCE, "emit");
            dispatch.queue.push_back(event);
            if dispatch.active {
                return;
            }
            dispatch.active = true;
        }

        loop {
            let next = {
                let mut dispatch = mutex_lock(&self.inner.dispatch, SOURCE, "emit.drain");
                match dispatch.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.active = false;
                        break;
                    }
                }
            };
            self.inner.deliver(&next);
        }
    }

    /// Handlers currently registered.
    pub fn handler_count(&self) -> usize {
        mutex_lock(&self.inner.handlers, SOURCE, "handler_count").len()
    }

    /// Handler panics absorbed since creation.
    pub fn handler_errors(&self) -> u64 {
        self.inner.handler_errors.load(Ordering::Relaxed)
    }

    /// Drop every handler. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *mutex_lock(&self.inner.handlers, SOURCE, "clear"));
        for entry in removed {
            entry.active.store(false, Ordering::Release);
        }
    }
}

/// Registration returned by [`InvalidationBus::on`]. Released on
/// `unsubscribe` or drop.
pub struct BusSubscription {
    id: u64,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    /// Stop delivery immediately. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::cache::KeyPattern;

    fn log() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn push(log: &Arc<StdMutex<Vec<String>>>, entry: String) {
        log.lock().expect("log").push(entry);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = InvalidationBus::new();
        let seen = log();

        let _subs: Vec<BusSubscription> = ["first", "second", "third"]
            .into_iter()
            .map(|label| {
                let seen = Arc::clone(&seen);
                bus.on(kinds::REFRESH, move |event| {
                    push(&seen, format!("{label}:{}", event.target));
                })
            })
            .collect();

        bus.emit(InvalidationEvent::refresh("categories"));
        assert_eq!(
            *seen.lock().expect("log"),
            vec!["first:categories", "second:categories", "third:categories"]
        );
    }

    #[test]
    fn matchers_filter_kinds() {
        let bus = InvalidationBus::new();
        let seen = log();
        let record = |label: &'static str| {
            let seen = Arc::clone(&seen);
            move |event: &InvalidationEvent| push(&seen, format!("{label}:{}", event.kind))
        };

        let _exact = bus.on(kinds::COUNTERS_UPDATED, record("exact"));
        let _prefix = bus.on(KindMatcher::prefix("reviews"), record("prefix"));
        let _contains = bus.on(KindMatcher::contains("updated"), record("contains"));

        bus.emit(InvalidationEvent::new("reviews_updated", KeyPattern::All));
        bus.emit(InvalidationEvent::new(kinds::COUNTERS_UPDATED, KeyPattern::All));

        assert_eq!(
            *seen.lock().expect("log"),
            vec![
                "prefix:reviews_updated",
                "contains:reviews_updated",
                "exact:counters_updated",
                "contains:counters_updated",
            ]
        );
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let bus = InvalidationBus::new();
        let seen = log();

        let _bad = bus.on(KindMatcher::Any, |_| panic!("handler bug"));
        let _good = bus.on(KindMatcher::Any, {
            let seen = Arc::clone(&seen);
            move |event| push(&seen, event.kind.clone())
        });

        bus.emit(InvalidationEvent::refresh("a"));
        bus.emit(InvalidationEvent::refresh("b"));

        assert_eq!(seen.lock().expect("log").len(), 2);
        assert_eq!(bus.handler_errors(), 2);
    }

    #[test]
    fn reentrant_emits_are_delivered_in_order() {
        let bus = InvalidationBus::new();
        let seen = log();

        let _chain = bus.on(kinds::CACHE_INVALIDATED, {
            let bus = bus.clone();
            move |_| bus.emit(InvalidationEvent::refresh("after"))
        });
        let _recorder = bus.on(KindMatcher::Any, {
            let seen = Arc::clone(&seen);
            move |event| push(&seen, format!("{}#{}", event.kind, event.epoch))
        });

        bus.emit(InvalidationEvent::invalidated(KeyPattern::All));
        assert_eq!(
            *seen.lock().expect("log"),
            vec!["cache_invalidated#0", "refresh#1"]
        );
    }

    #[test]
    fn unsubscribe_takes_effect_mid_dispatch() {
        let bus = InvalidationBus::new();
        let seen = log();
        let victim: Arc<StdMutex<Option<BusSubscription>>> = Arc::new(StdMutex::new(None));

        let _killer = bus.on(KindMatcher::Any, {
            let victim = Arc::clone(&victim);
            move |_| {
                if let Some(sub) = victim.lock().expect("victim").as_ref() {
                    sub.unsubscribe();
                }
            }
        });
        let sub = bus.on(KindMatcher::Any, {
            let seen = Arc::clone(&seen);
            move |event| push(&seen, event.kind.clone())
        });
        *victim.lock().expect("victim") = Some(sub);

        bus.emit(InvalidationEvent::refresh("a"));
        assert!(seen.lock().expect("log").is_empty());
        assert_eq!(bus.handler_count(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_runs_on_drop() {
        let bus = InvalidationBus::new();
        let sub = bus.on(KindMatcher::Any, |_| {});
        let other = bus.on(KindMatcher::Any, |_| {});
        assert_eq!(bus.handler_count(), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.handler_count(), 1);

        drop(other);
        assert_eq!(bus.handler_count(), 0);
    }
}
