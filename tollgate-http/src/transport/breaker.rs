//! Consecutive-failure circuit breaker for ingest delivery.
//!
//! Time is passed in explicitly so the state machine can be driven
//! deterministically in tests.

use std::time::Duration;

use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed and the single probe has been handed out.
    HalfOpen,
}

/// Opens after `threshold` consecutive failures, stays open for `cooldown`,
/// then lets exactly one probe through.
#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: State,
}

impl CircuitBreaker {
    pub(crate) const fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            state: State::Closed,
        }
    }

    /// Asks for permission to make a delivery attempt.
    ///
    /// Moves an expired open circuit to half-open and grants the single probe.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { until } if now >= until => {
                self.state = State::HalfOpen;
                true
            }
            State::Open { .. } | State::HalfOpen => false,
        }
    }

    /// Returns `true` if an attempt made now would be refused.
    pub(crate) fn is_open(&self, now: Instant) -> bool {
        match self.state {
            State::Closed => false,
            State::Open { until } => now < until,
            State::HalfOpen => true,
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = State::Closed;
    }

    /// Records a failed attempt. Returns `true` if this failure opened the circuit.
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let reopen = self.state == State::HalfOpen
            || self.consecutive_failures >= self.threshold;
        if reopen && !matches!(self.state, State::Open { .. }) {
            self.state = State::Open {
                until: now + self.cooldown,
            };
            return true;
        }
        false
    }

    /// Forces the circuit closed and clears the failure count.
    pub(crate) fn reset(&mut self) {
        self.record_success();
    }

    pub(crate) const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
