use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Start time of the last successful fetch per key.
#[derive(Default)]
pub(crate) struct ThrottleTable {
    started: DashMap<String, Instant>,
}

impl ThrottleTable {
    /// Time left in the window opened by the last successful fetch of `key`.
    ///
    /// An elapsed window is forgotten.
    pub(crate) fn remaining(&self, key: &str, window: Duration) -> Option<Duration> {
        let started_at = *self.started.get(key)?;
        let remaining = window.checked_sub(started_at.elapsed()).filter(|left| !left.is_zero());
        if remaining.is_none() {
            self.started
                .remove_if(key, |_, recorded| *recorded == started_at);
        }
        remaining
    }

    pub(crate) fn record(&self, key: &str, started_at: Instant) {
        self.started.insert(key.to_string(), started_at);
    }

    pub(crate) fn reset(&self, key: &str) -> bool {
        self.started.remove(key).is_some()
    }

    pub(crate) fn reset_where(&self, mut predicate: impl FnMut(&str) -> bool) {
        self.started.retain(|key, _| !predicate(key));
    }

    pub(crate) fn clear(&self) {
        self.started.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.started.len()
    }
}
