//! Connection state machine for one push channel.
//!
//! Pure and clock-free: the driver task feeds it transport outcomes and acts
//! on the [`Transition`] it returns, so the policy is testable without I/O.

use std::time::Duration;

use serde::Serialize;

use crate::config::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_POLLING_INTERVAL_SECS,
};

/// Reconnect and polling policy shared by every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the channel degrades to polling.
    pub max_reconnect_attempts: u32,
    pub polling_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::ChannelSettings> for ChannelConfig {
    fn from(settings: &crate::config::ChannelSettings) -> Self {
        Self {
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            polling_interval: settings.polling_interval,
        }
    }
}

impl ChannelConfig {
    /// Delay before the `n`-th reconnect (0-based): `min(base * 2^n, max)`.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2_u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Open,
    Error,
    Reconnecting,
    /// Push delivery given up; synthetic updates fire on a fixed interval.
    Polling,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Live,
    Polling,
}

/// What the driver must do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Reconnect(Duration),
    Poll(Duration),
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    config: ChannelConfig,
    state: ChannelState,
    attempts: u32,
}

impl ChannelMachine {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: ChannelState::Connecting,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn mode(&self) -> ChannelMode {
        match self.state {
            ChannelState::Polling => ChannelMode::Polling,
            _ => ChannelMode::Live,
        }
    }

    /// Consecutive failures since the last delivered event.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_opened(&mut self) {
        if self.state == ChannelState::Connecting {
            self.state = ChannelState::Open;
        }
    }

    /// Record a delivered event. Returns false when the channel is not open.
    pub fn on_event(&mut self) -> bool {
        if self.state != ChannelState::Open {
            return false;
        }
        self.attempts = 0;
        true
    }

    /// Record a failed open or a dropped connection.
    pub fn on_failure(&mut self) {
        if matches!(self.state, ChannelState::Polling | ChannelState::Closed) {
            return;
        }
        self.state = ChannelState::Error;
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Decide how to leave the `Error` state.
    pub fn recover(&mut self) -> Transition {
        if self.state == ChannelState::Polling || self.attempts >= self.config.max_reconnect_attempts {
            self.state = ChannelState::Polling;
            return Transition::Poll(self.config.polling_interval);
        }
        self.state = ChannelState::Reconnecting;
        Transition::Reconnect(self.config.delay_for(self.attempts.saturating_sub(1)))
    }

    /// Backoff elapsed; the next open attempt starts.
    pub fn begin_reconnect(&mut self) {
        if self.state == ChannelState::Reconnecting {
            self.state = ChannelState::Connecting;
        }
    }

    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(machine: &mut ChannelMachine) -> Transition {
        machine.on_failure();
        assert_eq!(machine.state(), ChannelState::Error);
        let transition = machine.recover();
        machine.begin_reconnect();
        transition
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let config = ChannelConfig::default();
        let delays: Vec<u64> = (0..7).map(|n| config.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn five_consecutive_failures_degrade_to_polling() {
        let mut machine = ChannelMachine::new(ChannelConfig::default());

        let transitions: Vec<Transition> = (0..5).map(|_| fail(&mut machine)).collect();
        assert_eq!(
            transitions,
            vec![
                Transition::Reconnect(Duration::from_millis(1_000)),
                Transition::Reconnect(Duration::from_millis(2_000)),
                Transition::Reconnect(Duration::from_millis(4_000)),
                Transition::Reconnect(Duration::from_millis(8_000)),
                Transition::Poll(Duration::from_secs(60)),
            ]
        );
        assert_eq!(machine.state(), ChannelState::Polling);
        assert_eq!(machine.mode(), ChannelMode::Polling);

        // Polling is terminal.
        machine.on_failure();
        assert_eq!(machine.state(), ChannelState::Polling);
    }

    #[test]
    fn delivered_event_resets_attempts() {
        let mut machine = ChannelMachine::new(ChannelConfig::default());
        fail(&mut machine);
        fail(&mut machine);
        assert_eq!(machine.attempts(), 2);

        machine.on_opened();
        assert_eq!(machine.state(), ChannelState::Open);
        assert!(machine.on_event());
        assert_eq!(machine.attempts(), 0);

        assert_eq!(
            fail(&mut machine),
            Transition::Reconnect(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn opening_without_events_keeps_counting() {
        let mut machine = ChannelMachine::new(ChannelConfig::default());
        for _ in 0..4 {
            machine.on_opened();
            fail(&mut machine);
        }
        machine.on_opened();
        assert!(matches!(fail(&mut machine), Transition::Poll(_)));
    }

    #[test]
    fn events_outside_open_are_rejected() {
        let mut machine = ChannelMachine::new(ChannelConfig::default());
        assert!(!machine.on_event());
        machine.close();
        machine.on_opened();
        assert_eq!(machine.state(), ChannelState::Closed);
    }
}
