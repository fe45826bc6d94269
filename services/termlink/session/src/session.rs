//! Engine configuration, lifecycle events, and diagnostics.
//!
//! These are the types a consumer of the [`ConnectionManager`] sees: the
//! knobs it is built with, the events it publishes, and the snapshot it
//! reports on request.
//!
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use crate::circuit_breaker::CircuitState;
use crate::failure_tracker::AttemptRecord;
use crate::retry::RetryStrategy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use termlink_wire::{Envelope, StreamKind};

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Configuration for a connection engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Missed pong windows tolerated before a forced close
    pub max_missed_pongs: u32,
    /// Connect timeout under normal conditions
    pub connect_timeout: Duration,
    /// Connect timeout while network blocking is suspected
    pub extended_connect_timeout: Duration,
    /// Closes sooner than this after connect start are "immediate"
    pub immediate_close_window: Duration,
    /// Delay between transport open and the handshake frame
    pub handshake_delay: Duration,
    /// Whether the health probe may gate attempts
    pub health_probe_enabled: bool,
    /// Upper bound on one health probe
    pub health_probe_timeout: Duration,
    /// Consecutive failures that open the breaker
    pub breaker_failure_threshold: u32,
    /// How long an open breaker refuses attempts
    pub breaker_reset_timeout: Duration,
    /// Automatic retries before giving up
    pub max_retry_attempts: u32,
    /// First standard backoff delay
    pub retry_base_delay: Duration,
    /// Standard backoff ceiling
    pub retry_max_delay: Duration,
    /// Margin added to the breaker cooldown when a retry is postponed
    pub breaker_delay_margin: Duration,
    /// Reported in the handshake frame
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            max_missed_pongs: 3,
            connect_timeout: Duration::from_secs(10),
            extended_connect_timeout: Duration::from_secs(15),
            immediate_close_window: Duration::from_secs(2),
            handshake_delay: Duration::from_millis(100),
            health_probe_enabled: true,
            health_probe_timeout: Duration::from_secs(3),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(30),
            max_retry_attempts: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            breaker_delay_margin: Duration::from_secs(1),
            user_agent: format!("termlink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Transport lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport
    Idle,
    /// Attempt in progress
    Connecting,
    /// Transport open
    Open,
    /// Close requested, transport not yet gone
    Closing,
}

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Transport opened
    Connected {
        /// Endpoint URL
        url: String,
    },
    /// Transport closed, or an attempt ended without opening
    Disconnected {
        /// Close code, if known
        code: Option<u16>,
        /// Human-readable reason
        reason: String,
        /// Time since the attempt started
        duration_ms: u64,
        /// Closed within the immediate-close window
        immediate: bool,
        /// Closed with a clean handshake
        was_clean: bool,
        /// Failure pattern suggests network blocking
        network_block_suspected: bool,
    },
    /// An attempt failed before any close could be reported
    Error {
        /// What went wrong
        message: String,
        /// The health probe refused the attempt
        health_check_failed: bool,
        /// Failure pattern suggests network blocking
        network_block_suspected: bool,
    },
    /// A retry has been scheduled
    Reconnecting {
        /// 1-based retry number
        attempt: u32,
        /// Retry budget
        max_attempts: u32,
        /// Wait before the retry
        delay_ms: u64,
        /// Backoff strategy in use
        strategy: RetryStrategy,
    },
    /// Retry postponed until the breaker cools down
    ReconnectDelayed {
        /// Wait before re-checking
        delay_ms: u64,
    },
    /// Retry budget spent; no more automatic attempts
    ReconnectFailed {
        /// Retries made
        attempts: u32,
    },
}

/// Application message delivered to message subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Command stream frame
    Stream {
        /// Frame kind
        kind: StreamKind,
        /// Frame payload
        payload: Option<Value>,
        /// Sender timestamp
        timestamp: Option<i64>,
    },
    /// Envelope of a type the engine does not know
    Unrecognized(Envelope),
    /// Plain text to display
    Output {
        /// Text
        data: String,
        /// Receive time, ms since the Unix epoch
        timestamp: i64,
        /// Synthesized from a server notice
        system: bool,
    },
}

impl ServerMessage {
    /// Best-effort displayable text.
    ///
    /// Stream frames expose `payload.data`, or `stdout`/`stderr` for
    /// `command_output`.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Output { data, .. } => Some(data.clone()),
            Self::Stream { kind, payload, .. } => {
                let payload = payload.as_ref()?;
                if let Some(data) = payload.get("data").and_then(Value::as_str) {
                    return Some(data.to_string());
                }
                match kind {
                    StreamKind::CommandOutput => {
                        let stdout = payload.get("stdout").and_then(Value::as_str).unwrap_or("");
                        let stderr = payload.get("stderr").and_then(Value::as_str).unwrap_or("");
                        Some(format!("{}{}", stdout, stderr)).filter(|s| !s.is_empty())
                    }
                    _ => None,
                }
            }
            Self::Unrecognized(_) => None,
        }
    }
}

/// Snapshot of engine state
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Transport stage
    pub connection_state: ConnectionState,
    /// Breaker stage
    pub circuit_state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Recent attempts, oldest first
    pub attempt_history: Vec<AttemptRecord>,
    /// Failure pattern suggests network blocking
    pub network_block_suspected: bool,
    /// Backoff strategy
    pub strategy: RetryStrategy,
    /// Retries since the last success or reset
    pub attempt_count: u32,
    /// Last successful open
    pub last_success_at: Option<DateTime<Utc>>,
    /// Connect timeout the next attempt will use
    pub connect_timeout_ms: u64,
}
