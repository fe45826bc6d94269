//! Reconnect delay computation.
//!
//! Two strategies are supported. `Standard` is a smooth exponential backoff;
//! `Aggressive` retries quickly at first and is used when the failure pattern
//! suggests network blocking rather than an unavailable server.

use serde::Serialize;
use std::time::Duration;

/// Backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `min(base × 1.5^(n-1), max)`
    Standard,
    /// Three fast retries, then 3s growing by 1.3× per attempt, capped at 20s
    Aggressive,
}

const STANDARD_FACTOR: f64 = 1.5;
const AGGRESSIVE_FAST_ATTEMPTS: u32 = 3;
const AGGRESSIVE_FAST_DELAY_MS: f64 = 1000.0;
const AGGRESSIVE_BASE_MS: f64 = 3000.0;
const AGGRESSIVE_FACTOR: f64 = 1.3;
const AGGRESSIVE_MAX_MS: f64 = 20_000.0;

/// Reconnect scheduling state
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    attempt_count: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with the standard strategy
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Standard,
            attempt_count: 0,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Active strategy
    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Switch strategy
    pub fn set_strategy(&mut self, strategy: RetryStrategy) {
        self.strategy = strategy;
    }

    /// Retries scheduled since the last success or reset
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Retry budget
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the retry budget is spent
    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Consume one retry and return its 1-based number and delay
    pub fn next_attempt(&mut self) -> (u32, Duration) {
        self.attempt_count += 1;
        (self.attempt_count, self.delay_for(self.attempt_count))
    }

    /// Delay for the 1-based attempt `n` under the active strategy
    pub fn delay_for(&self, n: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Standard => standard_delay(n, self.base_delay, self.max_delay),
            RetryStrategy::Aggressive => aggressive_delay(n),
        }
    }

    /// Zero the attempt count and return to the standard strategy
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.strategy = RetryStrategy::Standard;
    }
}

/// `min(base × 1.5^(n-1), max)`, truncated to whole milliseconds
pub fn standard_delay(n: u32, base: Duration, max: Duration) -> Duration {
    let exponent = n.saturating_sub(1) as i32;
    let ms = base.as_millis() as f64 * STANDARD_FACTOR.powi(exponent);
    Duration::from_millis(ms.min(max.as_millis() as f64) as u64)
}

/// Fixed 1s for the first three attempts; attempt 4 waits 3s and each later
/// attempt 1.3× longer, capped at 20s
pub fn aggressive_delay(n: u32) -> Duration {
    let ms = if n <= AGGRESSIVE_FAST_ATTEMPTS {
        AGGRESSIVE_FAST_DELAY_MS
    } else {
        let exponent = (n - AGGRESSIVE_FAST_ATTEMPTS - 1) as i32;
        (AGGRESSIVE_BASE_MS * AGGRESSIVE_FACTOR.powi(exponent)).min(AGGRESSIVE_MAX_MS)
    };
    Duration::from_millis(ms as u64)
}
