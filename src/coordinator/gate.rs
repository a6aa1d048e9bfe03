//! Global concurrency cap with a priority-ordered waiting queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::cache::Priority;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "coordinator::gate";

#[derive(Clone)]
pub(crate) struct PriorityGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    capacity: usize,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    running: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct Waiter {
    priority: Priority,
    seq: Reverse<u64>,
    slot: oneshot::Sender<Permit>,
}

impl Waiter {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, self.seq)
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A running slot. Dropping it hands the slot to the best waiter.
pub(crate) struct Permit {
    gate: Arc<GateInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        GateInner::release(&self.gate);
    }
}

impl PriorityGate {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity: capacity.max(1),
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    pub(crate) async fn acquire(&self, priority: Priority) -> Permit {
        loop {
            let waiting = {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "acquire");
                if state.running < self.inner.capacity {
                    state.running += 1;
                    return Permit {
                        gate: Arc::clone(&self.inner),
                    };
                }
                let (slot, waiting) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter {
                    priority,
                    seq: Reverse(seq),
                    slot,
                });
                waiting
            };

            if let Ok(permit) = waiting.await {
                return permit;
            }
        }
    }

    pub(crate) fn running(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "running").running
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "waiting").waiters.len()
    }
}

impl GateInner {
    fn release(gate: &Arc<Self>) {
        let next = {
            let mut state = mutex_lock(&gate.state, SOURCE, "release");
            match state.waiters.pop() {
                Some(waiter) => Some(waiter.slot),
                None => {
                    state.running = state.running.saturating_sub(1);
                    None
                }
            }
        };

        if let Some(slot) = next {
            // A waiter that gave up returns the permit, whose drop releases again.
            let _ = slot.send(Permit {
                gate: Arc::clone(gate),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let gate = PriorityGate::new(2);
        let first = gate.acquire(Priority::Normal).await;
        let _second = gate.acquire(Priority::Normal).await;
        assert_eq!(gate.running(), 2);

        drop(first);
        assert_eq!(gate.running(), 1);
    }

    #[tokio::test]
    async fn waiters_resume_by_priority_then_arrival() {
        let gate = PriorityGate::new(1);
        let held = gate.acquire(Priority::Normal).await;
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
            ("normal-2", Priority::Normal),
        ] {
            let gate = gate.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority).await;
                order.lock().expect("order lock").push(label);
            }));
            // Let the task enqueue before spawning the next one.
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.waiting(), 4);

        drop(held);
        for task in tasks {
            task.await.expect("task");
        }

        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["high", "normal-1", "normal-2", "low"]
        );
        assert_eq!(gate.running(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_a_slot() {
        let gate = PriorityGate::new(1);
        let held = gate.acquire(Priority::Normal).await;

        let abandoned = tokio::spawn({
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire(Priority::High).await;
            }
        });
        tokio::task::yield_now().await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        assert_eq!(gate.running(), 0);
        let _again = gate.acquire(Priority::Low).await;
        assert_eq!(gate.running(), 1);
    }
}
