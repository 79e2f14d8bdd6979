//! Failure-counting circuit breaker.
//!
//! Pure state machine: every time-dependent check takes `now` explicitly, so
//! cooldowns are evaluated lazily when the breaker is consulted rather than by
//! a background timer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::HalfOpen => "HALF_OPEN",
            BreakerState::Open => "OPEN",
        }
    }
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 5;

/// One named breaker, stored inside the unified state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub name: String,
    pub failures: u32,
    /// Successes accumulated while HALF_OPEN.
    pub successes: u32,
    pub state: BreakerState,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_minutes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::new("")
    }
}

impl CircuitBreakerState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures: 0,
            successes: 0,
            state: BreakerState::Closed,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            opened_at: None,
            last_failure: None,
        }
    }

    pub fn with_thresholds(mut self, failure: u32, success: u32, cooldown_minutes: u32) -> Self {
        self.failure_threshold = failure;
        self.success_threshold = success;
        self.cooldown_minutes = cooldown_minutes;
        self
    }

    /// Count a failure. HALF_OPEN re-opens immediately; CLOSED opens once the
    /// failure threshold is reached.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> BreakerState {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
        match self.state {
            BreakerState::HalfOpen => self.open(now),
            BreakerState::Closed if self.failures >= self.failure_threshold => self.open(now),
            BreakerState::Closed | BreakerState::Open => {}
        }
        self.state
    }

    /// Count a success. Resets the failure counter; HALF_OPEN closes after
    /// `success_threshold` successes.
    pub fn record_success(&mut self) -> BreakerState {
        self.failures = 0;
        if self.state == BreakerState::HalfOpen {
            self.successes = self.successes.saturating_add(1);
            if self.successes >= self.success_threshold {
                self.state = BreakerState::Closed;
                self.successes = 0;
                self.opened_at = None;
            }
        }
        self.state
    }

    /// Whether an attempt may proceed. An OPEN breaker whose cooldown has
    /// elapsed moves to HALF_OPEN and allows the attempt.
    pub fn can_execute(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != BreakerState::Open {
            return true;
        }
        if self.cooldown_remaining(now).is_zero() {
            self.state = BreakerState::HalfOpen;
            self.successes = 0;
            return true;
        }
        false
    }

    /// Time left before an OPEN breaker may probe again. Zero when not OPEN.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        if self.state != BreakerState::Open {
            return std::time::Duration::ZERO;
        }
        let Some(opened_at) = self.opened_at else {
            return std::time::Duration::ZERO;
        };
        let ready_at = opened_at + Duration::minutes(i64::from(self.cooldown_minutes));
        (ready_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name)).with_thresholds(
            self.failure_threshold,
            self.success_threshold,
            self.cooldown_minutes,
        );
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.successes = 0;
        self.opened_at = Some(now);
    }
}
