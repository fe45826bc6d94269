//! Connection attempt history and network-block detection

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use termlink_wire::close_code;
use tracing::{debug, warn};

/// Number of attempts kept in the history
pub const HISTORY_CAPACITY: usize = 10;

/// Number of most recent attempts the classifier looks at
pub const CLASSIFY_WINDOW: usize = 5;

/// Outcome of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// Whether the attempt counts as a success
    pub success: bool,
    /// Time from connect start to the outcome, in milliseconds
    pub duration_ms: u64,
    /// Close code, if the transport reported one
    pub code: Option<u16>,
    /// Failed after running into the connect timeout active at the time
    pub timed_out: bool,
}

impl AttemptRecord {
    /// Record stamped with the current time
    pub fn now(success: bool, duration: Duration, code: Option<u16>) -> Self {
        Self {
            timestamp: Utc::now(),
            success,
            duration_ms: duration.as_millis() as u64,
            code,
            timed_out: false,
        }
    }
}

/// Classifies recent failures to detect firewall-like blocking
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    /// Most recent attempts, oldest first
    history: VecDeque<AttemptRecord>,
    /// Result of the last evaluation
    network_block_suspected: bool,
    /// Failures shorter than this count as "fast"
    fast_failure: Duration,
    /// Fast abnormal failures needed to suspect blocking
    fast_failure_threshold: usize,
    /// Timed-out failures needed to suspect blocking
    timeout_threshold: usize,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier {
    /// Create an empty classifier
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            network_block_suspected: false,
            fast_failure: Duration::from_millis(1000),
            fast_failure_threshold: 3,
            timeout_threshold: 2,
        }
    }

    /// Record an attempt and re-evaluate the blocking flag.
    ///
    /// `connect_timeout` is the timeout that was active for the attempt; a
    /// failure lasting at least that long is stored as timed out.
    pub fn record(&mut self, mut record: AttemptRecord, connect_timeout: Duration) -> bool {
        record.timed_out =
            !record.success && record.duration_ms >= connect_timeout.as_millis() as u64;
        debug!(
            "Recorded attempt (success: {}, duration: {}ms, code: {:?})",
            record.success, record.duration_ms, record.code
        );

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(record);

        let was_suspected = self.network_block_suspected;
        self.network_block_suspected = self.evaluate();
        if self.network_block_suspected && !was_suspected {
            warn!("Failure pattern suggests network or firewall blocking");
        } else if was_suspected && !self.network_block_suspected {
            debug!("Network blocking no longer suspected");
        }
        self.network_block_suspected
    }

    fn evaluate(&self) -> bool {
        let fast_ms = self.fast_failure.as_millis() as u64;

        let recent = self.history.iter().rev().take(CLASSIFY_WINDOW);
        let (mut fast_failures, mut timeouts) = (0, 0);
        for record in recent.filter(|r| !r.success) {
            if record.duration_ms < fast_ms && close_code::is_abnormal_or_unknown(record.code) {
                fast_failures += 1;
            }
            if record.timed_out {
                timeouts += 1;
            }
        }

        fast_failures >= self.fast_failure_threshold || timeouts >= self.timeout_threshold
    }

    /// Whether the recent pattern looks like network blocking
    pub fn network_block_suspected(&self) -> bool {
        self.network_block_suspected
    }

    /// Attempt history, oldest first
    pub fn history(&self) -> Vec<AttemptRecord> {
        self.history.iter().cloned().collect()
    }

    /// Forget all attempts and clear the flag
    pub fn clear(&mut self) {
        self.history.clear();
        self.network_block_suspected = false;
    }
}
