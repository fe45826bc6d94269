//! Circuit breaker gating new connection attempts.
//!
//! ```text
//! Closed   → Open:     consecutive failures reach the threshold
//! Open     → HalfOpen: an attempt is made once the reset deadline passes
//! HalfOpen → Closed:   the trial attempt succeeds
//! HalfOpen → Open:     the trial attempt fails (fresh deadline)
//! ```

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts pass through
    Closed,
    /// Attempts are refused until the reset deadline
    Open,
    /// One trial attempt is in flight
    HalfOpen,
}

/// Consecutive-failure circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    reset_deadline: Option<Instant>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            reset_deadline: None,
            failure_threshold,
            reset_timeout,
        }
    }

    /// Current stage
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures recorded since the last success or reset
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Deadline after which an open breaker admits a trial
    pub fn reset_deadline(&self) -> Option<Instant> {
        self.reset_deadline
    }

    /// Whether a connection attempt may be made now.
    ///
    /// An open breaker whose deadline has passed moves to half-open and
    /// admits the attempt.
    pub fn can_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.reset_deadline {
                Some(deadline) if now < deadline => false,
                _ => {
                    info!("Circuit breaker half-open, allowing trial attempt");
                    self.state = CircuitState::HalfOpen;
                    true
                }
            },
        }
    }

    /// Time left before an open breaker admits a trial. `None` when an
    /// attempt would be allowed now.
    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.reset_deadline) {
            (CircuitState::Open, Some(deadline)) if now < deadline => Some(deadline - now),
            _ => None,
        }
    }

    /// Record the outcome of one attempt
    pub fn record_outcome(&mut self, success: bool, now: Instant) {
        if success {
            if self.state != CircuitState::Closed {
                info!("Circuit breaker closed after successful attempt");
            }
            self.state = CircuitState::Closed;
            self.consecutive_failures = 0;
            self.reset_deadline = None;
            return;
        }

        self.consecutive_failures += 1;
        debug!(
            "Circuit breaker recorded failure ({} consecutive)",
            self.consecutive_failures
        );

        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                warn!(
                    "Circuit breaker opened after {} consecutive failures; cooling down for {:?}",
                    self.consecutive_failures, self.reset_timeout
                );
                self.open(now);
            }
            CircuitState::HalfOpen => {
                warn!("Trial attempt failed; circuit breaker re-opened");
                self.open(now);
            }
            _ => {}
        }
    }

    /// Return to closed with no recorded failures
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.reset_deadline = None;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.reset_deadline = Some(now + self.reset_timeout);
    }
}
