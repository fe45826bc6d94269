//! Heartbeat tracking with PING/PONG.
//!
//! The monitor runs only while the connection is open. On every tick it
//! checks how long ago the last pong arrived; too many missed windows in a
//! row means the connection is silently dead.

use crate::session::now_millis;
use std::time::Duration;
use termlink_wire::OutboundFrame;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reason attached to a heartbeat-forced close
pub const LIVENESS_TIMEOUT_REASON: &str = "Connection timeout - no pong responses (liveness timeout)";

/// What the monitor wants done on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame
    SendPing,
    /// Close the transport, the peer stopped answering
    ForceClose {
        /// Consecutive missed windows
        missed: u32,
    },
}

/// Liveness tracking state
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    /// Time between ticks
    interval: Duration,
    /// Last pong received (or monitor start)
    last_pong_at: Option<Instant>,
    /// Consecutive windows without a pong
    missed_count: u32,
    /// The current tick already counted a miss
    tick_counted: bool,
    /// Missed windows tolerated before closing
    max_missed: u32,
}

impl HeartbeatState {
    /// Create an idle monitor
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            last_pong_at: None,
            missed_count: 0,
            tick_counted: false,
            max_missed,
        }
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long a pong may be outstanding before a window counts as missed
    pub fn pong_window(&self) -> Duration {
        self.interval.mul_f64(1.5)
    }

    /// Consecutive missed windows
    pub fn missed_count(&self) -> u32 {
        self.missed_count
    }

    /// Last pong time, `None` while stopped
    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    /// Begin tracking from `now`
    pub fn start(&mut self, now: Instant) {
        self.last_pong_at = Some(now);
        self.missed_count = 0;
        self.tick_counted = false;
    }

    /// Stop tracking
    pub fn stop(&mut self) {
        self.last_pong_at = None;
        self.missed_count = 0;
        self.tick_counted = false;
    }

    /// Evaluate one tick
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        let last = *self.last_pong_at.get_or_insert(now);
        let since_pong = now.saturating_duration_since(last);

        self.tick_counted = since_pong > self.pong_window();
        if self.tick_counted {
            self.missed_count += 1;
            warn!(
                "Missed pong #{}, time since last pong: {}s",
                self.missed_count,
                since_pong.as_secs()
            );

            if self.missed_count >= self.max_missed {
                return HeartbeatAction::ForceClose {
                    missed: self.missed_count,
                };
            }
        }

        HeartbeatAction::SendPing
    }

    /// A pong arrived
    pub fn on_pong(&mut self, now: Instant) {
        debug!("Received pong (missed count was {})", self.missed_count);
        self.last_pong_at = Some(now);
        self.missed_count = 0;
    }

    /// A ping could not be written; counts as a missed pong unless this
    /// tick already counted one
    pub fn on_ping_failed(&mut self) {
        if !self.tick_counted {
            self.missed_count += 1;
            self.tick_counted = true;
        }
    }
}

/// Build a heartbeat PING frame
pub fn build_ping() -> OutboundFrame {
    OutboundFrame::ping(now_millis())
}

/// Build a PONG frame answering a server ping
pub fn build_pong() -> OutboundFrame {
    OutboundFrame::pong(now_millis())
}
