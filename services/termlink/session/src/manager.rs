//! Connection manager: owns the transport and every piece of resilience state.
//!
//! A [`ConnectionManager`] is a cheap, cloneable handle. All state lives behind
//! a single mutex that is never held across an `.await`; subscriber callbacks
//! run only after it is released, so a callback may call back into the
//! manager. Background work (the connect attempt and its reader, heartbeat,
//! handshake and retry timers) runs in tokio tasks that hold weak references
//! and are aborted when the last handle is dropped.
//!
//! Every attempt carries an epoch. Any task whose epoch no longer matches the
//! current one exits without touching state.
//!
//! ## Failure accounting
//!
//! Each attempt produces exactly one [`AttemptRecord`], written when the
//! attempt ends. The circuit breaker also sees exactly one outcome per
//! attempt. An open transport is settled as a success once it outlives the
//! immediate-close window, which also resets the retry count. An attempt that
//! ends before it settles is judged at the end: an immediate close with any
//! code other than 1000 is a failure, as is an attempt that never opened.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use termlink_wire::{close_code, decode_inbound, encode_outbound, InboundFrame, OutboundFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::dispatch::{DispatchRegistry, SubscriptionId};
use crate::error::SessionError;
use crate::failure_tracker::{AttemptRecord, FailureClassifier};
use crate::handshake::{build_connection_frame, new_client_id};
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::keepalive::{
    build_ping, build_pong, HeartbeatAction, HeartbeatState, LIVENESS_TIMEOUT_REASON,
};
use crate::retry::{RetryPolicy, RetryStrategy};
use crate::session::{
    now_millis, ConnectionState, Diagnostics, EngineConfig, LifecycleEvent, ServerMessage,
};
use crate::transport::{Connector, TransportCommand, TransportEvent, WebSocketConnector};

/// Consecutive failures after which the health probe is consulted
const PROBE_FAILURE_THRESHOLD: u32 = 3;
/// Consecutive failures after which suspected blocking switches to aggressive retries
const AGGRESSIVE_FAILURE_THRESHOLD: u32 = 3;

/// Floor for the heartbeat period; tokio intervals reject a zero period
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT_MESSAGE: &str = "Connection timeout - server may be unavailable";
const CONNECT_FAILED_MESSAGE: &str =
    "Failed to connect - check if server is running and URL is correct";
const HEALTH_CHECK_FAILED_MESSAGE: &str = "Health check failed - server appears to be down";

/// Pending background tasks
#[derive(Default)]
struct Timers {
    attempt: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    handshake: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Timers {
    /// Stop everything tied to the current connection
    fn cancel_connection(&mut self) {
        abort(&mut self.attempt);
        abort(&mut self.settle);
        abort(&mut self.heartbeat);
        abort(&mut self.handshake);
    }

    fn cancel_all(&mut self) {
        self.cancel_connection();
        abort(&mut self.retry);
    }
}

struct EngineState {
    connection: ConnectionState,
    url: Option<String>,
    epoch: u64,
    /// Set when the transport open starts, after any health probe
    attempt_started: Option<Instant>,
    /// Connect timeout chosen for the current attempt
    attempt_timeout: Duration,
    /// Breaker and retry outcome of the current attempt already recorded
    outcome_settled: bool,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    reconnect_enabled: bool,
    breaker: CircuitBreaker,
    classifier: FailureClassifier,
    retry: RetryPolicy,
    heartbeat: HeartbeatState,
    timers: Timers,
    last_success_at: Option<DateTime<Utc>>,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            connection: ConnectionState::Idle,
            url: None,
            epoch: 0,
            attempt_started: None,
            attempt_timeout: config.connect_timeout,
            outcome_settled: false,
            outbound: None,
            reconnect_enabled: true,
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_reset_timeout,
            ),
            classifier: FailureClassifier::new(),
            retry: RetryPolicy::new(
                config.max_retry_attempts,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            heartbeat: HeartbeatState::new(
                config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
                config.max_missed_pongs,
            ),
            timers: Timers::default(),
            last_success_at: None,
        }
    }

    fn connect_timeout(&self, config: &EngineConfig) -> Duration {
        if self.classifier.network_block_suspected() {
            config.extended_connect_timeout
        } else {
            config.connect_timeout
        }
    }

    fn elapsed_since_attempt(&self, now: Instant) -> Duration {
        self.attempt_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// Queue a frame on the open transport
    fn write(&self, frame: &OutboundFrame) -> bool {
        let Some(outbound) = self.outbound.as_ref() else {
            return false;
        };
        match encode_outbound(frame) {
            Ok(text) => outbound.send(TransportCommand::Text(text)).is_ok(),
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.frame_type(), e);
                false
            }
        }
    }
}

/// How an attempt ended
struct AttemptEnd {
    code: Option<u16>,
    reason: String,
    was_clean: bool,
    /// Error reported ahead of the disconnect
    error: Option<String>,
    /// Close frame for a transport that is still up
    close_frame: Option<(u16, String)>,
}

#[derive(Debug, Clone, Copy)]
enum RetryStep {
    Connect,
    Recheck,
}

struct Inner {
    config: EngineConfig,
    client_id: String,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<EngineState>,
    messages: DispatchRegistry<ServerMessage>,
    lifecycle: DispatchRegistry<LifecycleEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.timers.cancel_all();
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(TransportCommand::Close {
                code: close_code::GOING_AWAY,
                reason: "Client shutting down".to_string(),
            });
        }
    }
}

/// Handle to one connection engine
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.inner.client_id)
            .field("connection", &state.connection)
            .field("url", &state.url)
            .finish()
    }
}

impl ConnectionManager {
    /// Create an engine using the WebSocket transport and HTTP health probe
    pub fn new(config: EngineConfig) -> Self {
        let probe = HttpHealthProbe::new(config.health_probe_timeout);
        Self::with_parts(config, Arc::new(WebSocketConnector::new()), Arc::new(probe))
    }

    /// Create an engine with a custom transport and health probe
    pub fn with_parts(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let state = EngineState::new(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                client_id: new_client_id(),
                connector,
                probe,
                state: Mutex::new(state),
                messages: DispatchRegistry::new("message"),
                lifecycle: DispatchRegistry::new("lifecycle"),
            }),
        }
    }

    /// Start connecting to `url`.
    ///
    /// Returns immediately; the outcome arrives as a lifecycle event. Does
    /// nothing while already connecting or connected. Fails with
    /// [`SessionError::CircuitOpen`] without touching the network while the
    /// breaker refuses attempts. Must be called within a Tokio runtime.
    pub fn connect(&self, url: &str) -> Result<(), SessionError> {
        Url::parse(url).map_err(|e| SessionError::InvalidUrl(format!("{}: {}", url, e)))?;
        let mut state = self.inner.state.lock();
        self.inner.start_attempt(&mut state, url)
    }

    /// Close the connection and stop automatic reconnection.
    ///
    /// The circuit breaker keeps its state; use
    /// [`reset_reconnection`](Self::reset_reconnection) to clear it.
    pub fn disconnect(&self, reason: &str) {
        self.inner.disconnect(reason);
    }

    /// Send a command. Returns `false` when not connected or the write was refused.
    pub fn send(&self, command: &str) -> bool {
        self.send_frame(&OutboundFrame::command(command, now_millis()))
    }

    /// Send any outbound frame. Returns `false` when not connected or the
    /// write was refused.
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        let state = self.inner.state.lock();
        if state.connection != ConnectionState::Open {
            debug!("Not connected, dropping {} frame", frame.frame_type());
            return false;
        }
        state.write(frame)
    }

    /// Clear breaker, retry and failure history, and re-arm automatic reconnection
    pub fn reset_reconnection(&self) {
        let mut state = self.inner.state.lock();
        state.breaker.reset();
        state.retry.reset();
        state.classifier.clear();
        state.reconnect_enabled = true;
        abort(&mut state.timers.retry);
        info!("Reconnection state reset");
    }

    /// Current transport stage
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Snapshot of the engine's resilience state
    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.inner.state.lock();
        Diagnostics {
            connection_state: state.connection,
            circuit_state: state.breaker.state(),
            consecutive_failures: state.breaker.consecutive_failures(),
            attempt_history: state.classifier.history(),
            network_block_suspected: state.classifier.network_block_suspected(),
            strategy: state.retry.strategy(),
            attempt_count: state.retry.attempt_count(),
            last_success_at: state.last_success_at,
            connect_timeout_ms: state.connect_timeout(&self.inner.config).as_millis() as u64,
        }
    }

    /// Receive inbound application messages
    pub fn subscribe_messages<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(handler)
    }

    /// Stop receiving inbound messages
    pub fn unsubscribe_messages(&self, id: SubscriptionId) -> bool {
        self.inner.messages.unsubscribe(id)
    }

    /// Receive lifecycle events
    pub fn subscribe_lifecycle<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle.subscribe(handler)
    }

    /// Stop receiving lifecycle events
    pub fn unsubscribe_lifecycle(&self, id: SubscriptionId) -> bool {
        self.inner.lifecycle.unsubscribe(id)
    }
}

impl Inner {
    fn start_attempt(
        self: &Arc<Self>,
        state: &mut EngineState,
        url: &str,
    ) -> Result<(), SessionError> {
        if matches!(
            state.connection,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            debug!("Already connected or connecting, ignoring connect to {}", url);
            return Ok(());
        }

        let now = Instant::now();
        if !state.breaker.can_attempt(now) {
            let retry_after = state.breaker.remaining_cooldown(now).unwrap_or_default();
            warn!(
                "Circuit breaker open, refusing connection attempt for another {}ms",
                retry_after.as_millis()
            );
            return Err(SessionError::CircuitOpen { retry_after });
        }

        abort(&mut state.timers.retry);
        state.epoch += 1;
        state.connection = ConnectionState::Connecting;
        state.url = Some(url.to_string());
        state.attempt_started = None;
        state.outcome_settled = false;
        state.attempt_timeout = state.connect_timeout(&self.config);
        info!(
            "Attempting to connect to {} (timeout {}ms)",
            url,
            state.attempt_timeout.as_millis()
        );

        let task = tokio::spawn(run_attempt(
            Arc::downgrade(self),
            url.to_string(),
            state.epoch,
        ));
        abort(&mut state.timers.attempt);
        state.timers.attempt = Some(task);
        Ok(())
    }

    /// Returns whether the attempt should go ahead
    fn on_probe_result(self: &Arc<Self>, epoch: u64, healthy: bool) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        if healthy {
            debug!("Health check passed");
            return true;
        }
        if state.breaker.state() == CircuitState::Closed {
            warn!("Health check failed, attempting connection anyway");
            return true;
        }

        warn!(
            "Health check failed with circuit breaker {:?}, skipping connection attempt",
            state.breaker.state()
        );
        let now = Instant::now();
        state.timers.cancel_connection();
        state.connection = ConnectionState::Idle;
        state.epoch += 1;
        state.breaker.record_outcome(false, now);
        state.outcome_settled = true;
        let timeout = state.attempt_timeout;
        let suspected = state
            .classifier
            .record(AttemptRecord::now(false, Duration::ZERO, None), timeout);

        let mut events = vec![LifecycleEvent::Error {
            message: HEALTH_CHECK_FAILED_MESSAGE.to_string(),
            health_check_failed: true,
            network_block_suspected: suspected,
        }];
        if state.reconnect_enabled {
            self.schedule_retry(&mut state, &mut events);
        }
        drop(state);
        self.publish_lifecycle(events);
        false
    }

    /// Returns whether the transport was adopted
    fn on_open(
        self: &Arc<Self>,
        epoch: u64,
        url: &str,
        commands: mpsc::UnboundedSender<TransportCommand>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.connection != ConnectionState::Connecting {
            debug!("Discarding transport of a superseded attempt");
            return false;
        }

        let now = Instant::now();
        info!(
            "Connected to {} in {}ms",
            url,
            state.elapsed_since_attempt(now).as_millis()
        );
        state.connection = ConnectionState::Open;
        state.outbound = Some(commands);
        state.reconnect_enabled = true;
        state.last_success_at = Some(Utc::now());
        state.heartbeat.start(now);

        let weak = Arc::downgrade(self);
        abort(&mut state.timers.settle);
        state.timers.settle = Some(tokio::spawn(settle_open(
            weak.clone(),
            epoch,
            self.config.immediate_close_window,
        )));
        let interval = state.heartbeat.interval();
        abort(&mut state.timers.heartbeat);
        state.timers.heartbeat = Some(tokio::spawn(run_heartbeat(weak.clone(), epoch, interval)));
        abort(&mut state.timers.handshake);
        state.timers.handshake = Some(tokio::spawn(send_handshake(
            weak,
            epoch,
            self.config.handshake_delay,
        )));
        drop(state);

        self.publish_lifecycle(vec![LifecycleEvent::Connected {
            url: url.to_string(),
        }]);
        true
    }

    /// The transport outlived the immediate-close window
    fn on_settled(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch
            || state.connection != ConnectionState::Open
            || state.outcome_settled
        {
            return;
        }
        state.outcome_settled = true;
        state.timers.settle = None;
        state.breaker.record_outcome(true, Instant::now());
        state.retry.reset();
        debug!("Connection stable, reconnection state reset");
    }

    /// Returns whether the reader should keep going
    fn handle_inbound(&self, epoch: u64, text: &str) -> bool {
        let decoded = decode_inbound(text);
        let message = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            match decoded {
                Ok(InboundFrame::Ping { .. }) => {
                    debug!("Received ping from server, answering with pong");
                    if !state.write(&build_pong()) {
                        warn!("Failed to answer server ping");
                    }
                    None
                }
                Ok(InboundFrame::Pong { .. }) => {
                    state.heartbeat.on_pong(Instant::now());
                    None
                }
                Ok(InboundFrame::SystemMessage { message }) => Some(ServerMessage::Output {
                    data: format!("[SYSTEM] {}", message),
                    timestamp: now_millis(),
                    system: true,
                }),
                Ok(InboundFrame::Stream {
                    kind,
                    payload,
                    timestamp,
                }) => Some(ServerMessage::Stream {
                    kind,
                    payload,
                    timestamp,
                }),
                Ok(InboundFrame::Unrecognized(envelope)) => {
                    debug!("Passing through unrecognized frame type '{}'", envelope.frame_type);
                    Some(ServerMessage::Unrecognized(envelope))
                }
                Err(e) if text.trim().is_empty() => {
                    debug!("Dropping blank frame: {}", e);
                    None
                }
                Err(e) => {
                    debug!("Forwarding undecodable frame as raw output: {}", e);
                    Some(ServerMessage::Output {
                        data: text.to_string(),
                        timestamp: now_millis(),
                        system: false,
                    })
                }
            }
        };

        if let Some(message) = message {
            self.messages.publish(&message);
        }
        true
    }

    /// Returns whether the heartbeat should keep running
    fn heartbeat_tick(self: &Arc<Self>, epoch: u64) -> bool {
        let action = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.connection != ConnectionState::Open {
                return false;
            }
            let action = state.heartbeat.on_tick(Instant::now());
            if action == HeartbeatAction::SendPing && !state.write(&build_ping()) {
                warn!("Failed to send ping");
                state.heartbeat.on_ping_failed();
            }
            action
        };

        match action {
            HeartbeatAction::SendPing => true,
            HeartbeatAction::ForceClose { missed } => {
                error!("No pong for {} heartbeat windows, closing connection", missed);
                self.finish_attempt(
                    epoch,
                    AttemptEnd {
                        code: Some(close_code::ABNORMAL),
                        reason: LIVENESS_TIMEOUT_REASON.to_string(),
                        was_clean: false,
                        error: None,
                        close_frame: Some((
                            close_code::GOING_AWAY,
                            LIVENESS_TIMEOUT_REASON.to_string(),
                        )),
                    },
                );
                false
            }
        }
    }

    /// Close path shared by every way an attempt can end
    fn finish_attempt(self: &Arc<Self>, epoch: u64, end: AttemptEnd) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!("Ignoring outcome of a superseded attempt");
            return;
        }

        let now = Instant::now();
        let opened = state.connection == ConnectionState::Open;

        state.timers.cancel_connection();
        state.heartbeat.stop();
        if let Some(outbound) = state.outbound.take() {
            if let Some((code, reason)) = end.close_frame {
                let _ = outbound.send(TransportCommand::Close { code, reason });
            }
        }
        state.connection = ConnectionState::Idle;
        state.epoch += 1;

        let duration = state.elapsed_since_attempt(now);
        let immediate = duration < self.config.immediate_close_window;
        let success = opened && !(immediate && end.code != Some(close_code::NORMAL));
        if !state.outcome_settled {
            state.outcome_settled = true;
            state.breaker.record_outcome(success, now);
            if success {
                state.retry.reset();
            }
        }
        let timeout = state.attempt_timeout;
        let suspected = state
            .classifier
            .record(AttemptRecord::now(success, duration, end.code), timeout);

        if opened && immediate && end.code == Some(close_code::NORMAL) {
            warn!("Server closed connection immediately after connecting - this may indicate a server-side issue");
        }

        let reason = if !end.reason.is_empty() {
            end.reason
        } else {
            match end.code {
                Some(code) => close_code::reason(code),
                None => "Connection closed".to_string(),
            }
        };
        info!(
            "Disconnected after {}ms (code: {:?}, reason: {})",
            duration.as_millis(),
            end.code,
            reason
        );

        let mut events = Vec::with_capacity(3);
        if let Some(message) = end.error {
            events.push(LifecycleEvent::Error {
                message,
                health_check_failed: false,
                network_block_suspected: suspected,
            });
        }
        events.push(LifecycleEvent::Disconnected {
            code: end.code,
            reason,
            duration_ms: duration.as_millis() as u64,
            immediate,
            was_clean: end.was_clean,
            network_block_suspected: suspected,
        });
        if state.reconnect_enabled {
            self.schedule_retry(&mut state, &mut events);
        }
        drop(state);
        self.publish_lifecycle(events);
    }

    fn disconnect(&self, reason: &str) {
        let mut state = self.state.lock();
        state.reconnect_enabled = false;
        state.timers.cancel_all();
        state.heartbeat.stop();
        state.epoch += 1;

        let previous = state.connection;
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(TransportCommand::Close {
                code: close_code::NORMAL,
                reason: reason.to_string(),
            });
        }
        state.connection = ConnectionState::Idle;

        let now = Instant::now();
        let duration = state.elapsed_since_attempt(now);
        let immediate = duration < self.config.immediate_close_window;
        let suspected = if previous == ConnectionState::Open {
            let timeout = state.attempt_timeout;
            state.classifier.record(
                AttemptRecord::now(true, duration, Some(close_code::NORMAL)),
                timeout,
            )
        } else {
            state.classifier.network_block_suspected()
        };
        info!("Disconnected: {}", reason);

        let events = match previous {
            ConnectionState::Open | ConnectionState::Connecting => {
                vec![LifecycleEvent::Disconnected {
                    code: Some(close_code::NORMAL),
                    reason: reason.to_string(),
                    duration_ms: duration.as_millis() as u64,
                    immediate,
                    was_clean: true,
                    network_block_suspected: suspected,
                }]
            }
            _ => Vec::new(),
        };
        drop(state);
        self.publish_lifecycle(events);
    }

    /// Decide what happens after a failed or closed attempt
    fn schedule_retry(self: &Arc<Self>, state: &mut EngineState, events: &mut Vec<LifecycleEvent>) {
        let strategy = if state.classifier.network_block_suspected()
            && state.breaker.consecutive_failures() >= AGGRESSIVE_FAILURE_THRESHOLD
        {
            RetryStrategy::Aggressive
        } else {
            RetryStrategy::Standard
        };
        if state.retry.strategy() != strategy {
            info!("Switching to {:?} reconnection strategy", strategy);
            state.retry.set_strategy(strategy);
        }

        if state.retry.exhausted() {
            error!(
                "Giving up after {} reconnection attempts",
                state.retry.attempt_count()
            );
            events.push(LifecycleEvent::ReconnectFailed {
                attempts: state.retry.attempt_count(),
            });
            return;
        }

        if let Some(cooldown) = state.breaker.remaining_cooldown(Instant::now()) {
            let delay = cooldown + self.config.breaker_delay_margin;
            info!(
                "Circuit breaker open, delaying reconnection by {}ms",
                delay.as_millis()
            );
            events.push(LifecycleEvent::ReconnectDelayed {
                delay_ms: delay.as_millis() as u64,
            });
            self.arm_retry(state, delay, RetryStep::Recheck);
            return;
        }

        let (attempt, delay) = state.retry.next_attempt();
        info!(
            "Reconnecting in {}ms (attempt {}/{}, {:?} strategy)",
            delay.as_millis(),
            attempt,
            state.retry.max_attempts(),
            strategy
        );
        events.push(LifecycleEvent::Reconnecting {
            attempt,
            max_attempts: state.retry.max_attempts(),
            delay_ms: delay.as_millis() as u64,
            strategy,
        });
        self.arm_retry(state, delay, RetryStep::Connect);
    }

    fn arm_retry(self: &Arc<Self>, state: &mut EngineState, delay: Duration, step: RetryStep) {
        abort(&mut state.timers.retry);
        let weak = Arc::downgrade(self);
        state.timers.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_retry_timer(step);
            }
        }));
    }

    fn on_retry_timer(self: &Arc<Self>, step: RetryStep) {
        let mut state = self.state.lock();
        if !state.reconnect_enabled || state.connection != ConnectionState::Idle {
            return;
        }
        state.timers.retry = None;

        let mut events = Vec::new();
        match (step, state.url.clone()) {
            (RetryStep::Connect, Some(url)) => match self.start_attempt(&mut state, &url) {
                Ok(()) => {}
                Err(SessionError::CircuitOpen { .. }) => {
                    self.schedule_retry(&mut state, &mut events)
                }
                Err(e) => error!("Reconnection attempt failed to start: {}", e),
            },
            (RetryStep::Connect, None) => {}
            (RetryStep::Recheck, _) => self.schedule_retry(&mut state, &mut events),
        }
        drop(state);
        self.publish_lifecycle(events);
    }

    fn publish_lifecycle(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            debug!("Lifecycle event: {:?}", event);
            self.lifecycle.publish(&event);
        }
    }
}

/// One connection attempt: optional health probe, transport open, then the
/// reader loop until the transport closes.
async fn run_attempt(weak: Weak<Inner>, url: String, epoch: u64) {
    let probe = {
        let Some(inner) = weak.upgrade() else { return };
        let state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        let evaluate = inner.config.health_probe_enabled
            && (state.breaker.state() != CircuitState::Closed
                || state.breaker.consecutive_failures() >= PROBE_FAILURE_THRESHOLD);
        evaluate.then(|| (inner.probe.clone(), inner.config.health_probe_timeout))
    };

    if let Some((probe, limit)) = probe {
        debug!("Checking server health before connecting");
        let healthy = tokio::time::timeout(limit, probe.check(&url))
            .await
            .unwrap_or(false);
        let Some(inner) = weak.upgrade() else { return };
        if !inner.on_probe_result(epoch, healthy) {
            return;
        }
    }

    let (connector, limit) = {
        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.attempt_started = Some(Instant::now());
        (inner.connector.clone(), state.attempt_timeout)
    };

    let outcome = tokio::time::timeout(limit, connector.connect(&url)).await;
    let mut events = {
        let Some(inner) = weak.upgrade() else { return };
        match outcome {
            Ok(Ok(handle)) => {
                if !inner.on_open(epoch, &url, handle.commands) {
                    return;
                }
                handle.events
            }
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", url, e);
                inner.finish_attempt(
                    epoch,
                    AttemptEnd {
                        code: Some(e.close_code()),
                        reason: String::new(),
                        was_clean: false,
                        error: Some(CONNECT_FAILED_MESSAGE.to_string()),
                        close_frame: None,
                    },
                );
                return;
            }
            Err(_) => {
                warn!("Connection to {} timed out after {}ms", url, limit.as_millis());
                inner.finish_attempt(
                    epoch,
                    AttemptEnd {
                        code: None,
                        reason: CONNECT_TIMEOUT_MESSAGE.to_string(),
                        was_clean: false,
                        error: Some(CONNECT_TIMEOUT_MESSAGE.to_string()),
                        close_frame: None,
                    },
                );
                return;
            }
        }
    };

    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        match event {
            TransportEvent::Text(text) => {
                if !inner.handle_inbound(epoch, &text) {
                    return;
                }
            }
            TransportEvent::Closed {
                code,
                reason,
                was_clean,
            } => {
                inner.finish_attempt(
                    epoch,
                    AttemptEnd {
                        code,
                        reason,
                        was_clean,
                        error: None,
                        close_frame: None,
                    },
                );
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.finish_attempt(
            epoch,
            AttemptEnd {
                code: Some(close_code::ABNORMAL),
                reason: String::new(),
                was_clean: false,
                error: None,
                close_frame: None,
            },
        );
    }
}

async fn settle_open(weak: Weak<Inner>, epoch: u64, window: Duration) {
    tokio::time::sleep(window).await;
    if let Some(inner) = weak.upgrade() {
        inner.on_settled(epoch);
    }
}

async fn run_heartbeat(weak: Weak<Inner>, epoch: u64, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { return };
        if !inner.heartbeat_tick(epoch) {
            return;
        }
    }
}

async fn send_handshake(weak: Weak<Inner>, epoch: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = weak.upgrade() else { return };
    let state = inner.state.lock();
    if state.epoch != epoch || state.connection != ConnectionState::Open {
        return;
    }
    let frame = build_connection_frame(&inner.config.user_agent, &inner.client_id);
    if state.write(&frame) {
        debug!("Sent connection handshake");
    } else {
        warn!("Failed to send connection handshake");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportHandle;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use termlink_wire::StreamKind;

    const URL: &str = "ws://localhost:8080/ws/room-1";

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Accept,
        Refuse,
        Hang,
    }

    /// Server side of an accepted mock transport
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<TransportEvent>,
        from_client: mpsc::UnboundedReceiver<TransportCommand>,
    }

    impl ServerEnd {
        fn send_text(&self, text: &str) {
            self.to_client
                .send(TransportEvent::Text(text.to_string()))
                .unwrap();
        }

        fn close(&self, code: u16, was_clean: bool) {
            self.to_client
                .send(TransportEvent::Closed {
                    code: Some(code),
                    reason: String::new(),
                    was_clean,
                })
                .unwrap();
        }

        /// Next text frame of type `kind`, skipping any others
        async fn frame_of_type(&mut self, kind: &str) -> Value {
            loop {
                match self.from_client.recv().await {
                    Some(TransportCommand::Text(text)) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if value["type"] == kind {
                            return value;
                        }
                    }
                    Some(other) => panic!("unexpected command {:?}", other),
                    None => panic!("client dropped the transport"),
                }
            }
        }
    }

    struct MockConnector {
        script: Mutex<VecDeque<Outcome>>,
        fallback: Outcome,
        attempts: AtomicUsize,
        servers: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MockConnector {
        fn new(
            script: Vec<Outcome>,
            fallback: Outcome,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (servers, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                attempts: AtomicUsize::new(0),
                servers,
            });
            (connector, rx)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<TransportHandle, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
            match outcome {
                Outcome::Accept => {
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    let (event_tx, event_rx) = mpsc::unbounded_channel();
                    let _ = self.servers.send(ServerEnd {
                        to_client: event_tx,
                        from_client: cmd_rx,
                    });
                    Ok(TransportHandle {
                        commands: cmd_tx,
                        events: event_rx,
                    })
                }
                Outcome::Refuse => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(TransportError::Connect("connection refused".to_string()))
                }
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    struct MockProbe {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl MockProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for MockProbe {
        async fn check(&self, _ws_url: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn engine(
        config: EngineConfig,
        connector: Arc<MockConnector>,
        probe: Arc<MockProbe>,
    ) -> ConnectionManager {
        ConnectionManager::with_parts(config, connector, probe)
    }

    fn lifecycle_events(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe_lifecycle(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    fn messages(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe_messages(move |message| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    /// Wait for the first event matching `pred`; also returns the events seen before it
    async fn wait_for<F>(
        rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
        mut pred: F,
    ) -> (LifecycleEvent, Vec<LifecycleEvent>)
    where
        F: FnMut(&LifecycleEvent) -> bool,
    {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = rx.recv().await.expect("lifecycle channel closed");
                if pred(&event) {
                    return (event, seen);
                }
                seen.push(event);
            }
        })
        .await
        .expect("timed out waiting for lifecycle event")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn is_connected(event: &LifecycleEvent) -> bool {
        matches!(event, LifecycleEvent::Connected { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_emits_connected_and_resets_attempt_count() {
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Refuse], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector.clone(), MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let (reconnecting, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Reconnecting { .. })).await;
        assert_eq!(
            reconnecting,
            LifecycleEvent::Reconnecting {
                attempt: 1,
                max_attempts: 5,
                delay_ms: 1000,
                strategy: RetryStrategy::Standard,
            }
        );
        assert_eq!(manager.diagnostics().attempt_count, 1);

        let (connected, _) = wait_for(&mut events, is_connected).await;
        assert_eq!(
            connected,
            LifecycleEvent::Connected {
                url: URL.to_string()
            }
        );
        assert!(manager.is_connected());
        assert_eq!(connector.attempts(), 2);

        // Counters only reset once the connection outlives the immediate window.
        assert_eq!(manager.diagnostics().attempt_count, 1);
        assert_eq!(manager.diagnostics().consecutive_failures, 1);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.attempt_count, 0);
        assert_eq!(diagnostics.circuit_state, CircuitState::Closed);
        assert_eq!(diagnostics.consecutive_failures, 0);
        assert!(diagnostics.last_success_at.is_some());

        let mut server = servers.recv().await.unwrap();
        let handshake = server.frame_of_type("connection").await;
        assert_eq!(handshake["payload"]["type"], "client_connected");
        assert!(handshake["payload"]["user_agent"]
            .as_str()
            .unwrap()
            .starts_with("termlink/"));

        manager.connect(URL).unwrap();
        settle().await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_five_immediate_failures() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Refuse);
        let probe = MockProbe::new(true);
        let manager = engine(EngineConfig::default(), connector.clone(), probe.clone());
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        let (delayed, seen) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectDelayed { .. })).await;
        assert_eq!(delayed, LifecycleEvent::ReconnectDelayed { delay_ms: 31_000 });

        let disconnects: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Disconnected {
                    code, immediate, ..
                } => Some((*code, *immediate)),
                _ => None,
            })
            .collect();
        assert_eq!(disconnects, vec![(Some(1006), true); 5]);
        assert_eq!(connector.attempts(), 5);
        // Probed once the failure count reached three; healthy, so not blocking.
        assert_eq!(probe.calls(), 2);

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.circuit_state, CircuitState::Open);
        assert_eq!(diagnostics.consecutive_failures, 5);
        assert_eq!(diagnostics.attempt_history.len(), 5);

        match manager.connect(URL) {
            Err(SessionError::CircuitOpen { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(30));
            }
            other => panic!("expected circuit open, got {:?}", other),
        }
        settle().await;
        assert_eq!(connector.attempts(), 5);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reconnection_clears_failure_state() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Refuse);
        let manager = engine(EngineConfig::default(), connector.clone(), MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectDelayed { .. })).await;
        assert!(manager.diagnostics().network_block_suspected);

        manager.reset_reconnection();
        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.circuit_state, CircuitState::Closed);
        assert_eq!(diagnostics.consecutive_failures, 0);
        assert_eq!(diagnostics.attempt_count, 0);
        assert!(diagnostics.attempt_history.is_empty());
        assert!(!diagnostics.network_block_suspected);
        assert_eq!(diagnostics.strategy, RetryStrategy::Standard);

        // The postponed retry was cancelled; only the manual attempt runs.
        manager.connect(URL).unwrap();
        let (disconnected, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        assert!(matches!(disconnected, LifecycleEvent::Disconnected { code: Some(1006), .. }));
        assert_eq!(connector.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ping_answered_without_touching_liveness() {
        let (connector, mut servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);
        let mut inbound = messages(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let mut server = servers.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let before = manager.inner.state.lock().heartbeat.last_pong_at();
        assert!(before.is_some());

        server.send_text(r#"{"type":"ping","timestamp":1700000000000}"#);
        let pong = server.frame_of_type("pong").await;
        assert_eq!(pong["client_id"], "http-ssh-client");
        assert!(pong["timestamp"].is_i64());
        assert_eq!(manager.inner.state.lock().heartbeat.last_pong_at(), before);

        server.send_text(r#"{"type":"pong","timestamp":1700000000001}"#);
        settle().await;
        let after = manager.inner.state.lock().heartbeat.last_pong_at();
        assert!(after > before);

        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_idle_returns_false() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector.clone(), MockProbe::new(true));

        assert!(!manager.send("ls -la"));
        assert_eq!(manager.state(), ConnectionState::Idle);
        settle().await;
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_open_writes_command_frame() {
        let (connector, mut servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let mut server = servers.recv().await.unwrap();

        assert!(manager.send("ls -la"));
        let frame = server.frame_of_type("command").await;
        assert_eq!(frame["payload"]["command"], "ls -la");
        assert!(frame["payload"]["timestamp"].is_i64());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pongs_force_liveness_close() {
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Accept], Outcome::Hang);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let opened_at = Instant::now();
        let mut server = servers.recv().await.unwrap();

        let (disconnected, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        match disconnected {
            LifecycleEvent::Disconnected {
                code,
                reason,
                was_clean,
                immediate,
                ..
            } => {
                assert_eq!(code, Some(1006));
                assert!(reason.contains("liveness timeout"));
                assert!(!was_clean);
                assert!(!immediate);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(Instant::now() - opened_at >= Duration::from_secs(100));
        assert_eq!(manager.state(), ConnectionState::Idle);

        let (reconnecting, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Reconnecting { .. })).await;
        assert!(matches!(
            reconnecting,
            LifecycleEvent::Reconnecting { attempt: 1, .. }
        ));

        let (mut pings, mut close) = (0, None);
        while let Ok(command) = server.from_client.try_recv() {
            match command {
                TransportCommand::Text(text) if text.contains(r#""type":"ping""#) => pings += 1,
                TransportCommand::Close { code, .. } => close = Some(code),
                _ => {}
            }
        }
        assert_eq!(pings, 3);
        assert_eq!(close, Some(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnection() {
        let (connector, mut servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector.clone(), MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let mut server = servers.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        manager.disconnect("User disconnected");
        let (disconnected, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        assert!(matches!(
            disconnected,
            LifecycleEvent::Disconnected {
                code: Some(1000),
                was_clean: true,
                immediate: false,
                ..
            }
        ));

        let mut close = None;
        while let Some(command) = server.from_client.recv().await {
            if let TransportCommand::Close { code, reason } = command {
                close = Some((code, reason));
                break;
            }
        }
        assert_eq!(close, Some((1000, "User disconnected".to_string())));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(connector.attempts(), 1);
        assert!(!manager.send("ls"));

        let history = manager.diagnostics().attempt_history;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].code, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_clean_close_counts_as_success() {
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Accept], Outcome::Hang);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let server = servers.recv().await.unwrap();
        server.close(1000, true);

        let (disconnected, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        assert_eq!(
            disconnected,
            LifecycleEvent::Disconnected {
                code: Some(1000),
                reason: "Normal closure".to_string(),
                duration_ms: 0,
                immediate: true,
                was_clean: true,
                network_block_suspected: false,
            }
        );
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::Reconnecting { .. })).await;

        let diagnostics = manager.diagnostics();
        assert!(diagnostics.attempt_history[0].success);
        assert_eq!(diagnostics.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_abnormal_close_is_recorded_as_failure() {
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Accept], Outcome::Hang);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let server = servers.recv().await.unwrap();
        server.close(1006, false);

        wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.attempt_history.len(), 1);
        assert!(!diagnostics.attempt_history[0].success);
        assert_eq!(diagnostics.consecutive_failures, 1);

        let (reconnecting, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Reconnecting { .. })).await;
        assert!(matches!(
            reconnecting,
            LifecycleEvent::Reconnecting { attempt: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_then_drop_opens_breaker() {
        let (connector, mut servers) = MockConnector::new(vec![], Outcome::Accept);
        let probe = MockProbe::new(true);
        let manager = engine(EngineConfig::default(), connector.clone(), probe.clone());
        let mut events = lifecycle_events(&manager);

        // Every upgrade succeeds and the link is dropped straight away.
        tokio::spawn(async move {
            while let Some(server) = servers.recv().await {
                server.close(1006, false);
            }
        });

        manager.connect(URL).unwrap();
        let (delayed, seen) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectDelayed { .. })).await;
        assert_eq!(delayed, LifecycleEvent::ReconnectDelayed { delay_ms: 31_000 });

        let schedule: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Reconnecting {
                    attempt, strategy, ..
                } => Some((*attempt, *strategy)),
                _ => None,
            })
            .collect();
        assert_eq!(
            schedule,
            vec![
                (1, RetryStrategy::Standard),
                (2, RetryStrategy::Standard),
                (3, RetryStrategy::Aggressive),
                (4, RetryStrategy::Aggressive),
            ]
        );
        assert_eq!(seen.iter().filter(|e| is_connected(e)).count(), 5);

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.circuit_state, CircuitState::Open);
        assert_eq!(diagnostics.consecutive_failures, 5);
        assert_eq!(diagnostics.attempt_count, 4);
        assert!(diagnostics.network_block_suspected);
        assert!(diagnostics.attempt_history.iter().all(|r| !r.success));
        assert_eq!(connector.attempts(), 5);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_settling_is_not_a_breaker_failure() {
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Accept], Outcome::Hang);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let server = servers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        server.close(1006, false);

        wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        let diagnostics = manager.diagnostics();
        assert!(diagnostics.attempt_history[0].success);
        assert_eq!(diagnostics.consecutive_failures, 0);
        assert_eq!(diagnostics.circuit_state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_still_monitors_liveness() {
        let config = EngineConfig {
            heartbeat_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        let (connector, mut servers) = MockConnector::new(vec![Outcome::Accept], Outcome::Hang);
        let manager = engine(config, connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let mut server = servers.recv().await.unwrap();

        let ping = server.frame_of_type("ping").await;
        assert!(ping["timestamp"].is_i64());
        let (disconnected, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        assert!(matches!(
            disconnected,
            LifecycleEvent::Disconnected { code: Some(1006), .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_with_strategy_switch() {
        let config = EngineConfig {
            breaker_failure_threshold: 100,
            ..EngineConfig::default()
        };
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Refuse);
        let manager = engine(config, connector.clone(), MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        let (failed, seen) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectFailed { .. })).await;
        assert_eq!(failed, LifecycleEvent::ReconnectFailed { attempts: 5 });
        assert_eq!(connector.attempts(), 6);

        let schedule: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Reconnecting {
                    delay_ms, strategy, ..
                } => Some((*delay_ms, *strategy)),
                _ => None,
            })
            .collect();
        assert_eq!(
            schedule,
            vec![
                (1000, RetryStrategy::Standard),
                (1500, RetryStrategy::Standard),
                (1000, RetryStrategy::Aggressive),
                (3000, RetryStrategy::Aggressive),
                (3900, RetryStrategy::Aggressive),
            ]
        );

        let diagnostics = manager.diagnostics();
        assert!(diagnostics.network_block_suspected);
        assert_eq!(diagnostics.connect_timeout_ms, 15_000);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_probe_blocks_half_open_trial() {
        let config = EngineConfig {
            breaker_failure_threshold: 2,
            breaker_reset_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Refuse);
        let probe = MockProbe::new(false);
        let manager = engine(config, connector.clone(), probe.clone());
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        let (delayed, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectDelayed { .. })).await;
        assert_eq!(delayed, LifecycleEvent::ReconnectDelayed { delay_ms: 6000 });

        let (error, _) = wait_for(&mut events, |e| {
            matches!(
                e,
                LifecycleEvent::Error {
                    health_check_failed: true,
                    ..
                }
            )
        })
        .await;
        assert!(matches!(error, LifecycleEvent::Error { .. }));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(probe.calls(), 1);

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.circuit_state, CircuitState::Open);
        let last = diagnostics.attempt_history.last().unwrap();
        assert!(!last.success);
        assert_eq!(last.duration_ms, 0);

        let (delayed, _) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectDelayed { .. })).await;
        assert_eq!(delayed, LifecycleEvent::ReconnectDelayed { delay_ms: 6000 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_a_failure() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Hang);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        let (disconnected, seen) =
            wait_for(&mut events, |e| matches!(e, LifecycleEvent::Disconnected { .. })).await;
        assert_eq!(
            seen,
            vec![LifecycleEvent::Error {
                message: CONNECT_TIMEOUT_MESSAGE.to_string(),
                health_check_failed: false,
                network_block_suspected: false,
            }]
        );
        match disconnected {
            LifecycleEvent::Disconnected {
                code,
                duration_ms,
                immediate,
                ..
            } => {
                assert_eq!(code, None);
                assert_eq!(duration_ms, 10_000);
                assert!(!immediate);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.diagnostics().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_reach_message_subscribers() {
        let (connector, mut servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        let mut events = lifecycle_events(&manager);
        let mut inbound = messages(&manager);

        manager.connect(URL).unwrap();
        wait_for(&mut events, is_connected).await;
        let server = servers.recv().await.unwrap();

        server.send_text(r#"{"type":"system_message","payload":{"message":"Welcome"}}"#);
        server.send_text(r#"{"type":"stdout","payload":{"data":"hello\n"},"timestamp":5}"#);
        server.send_text("   ");
        server.send_text("plain text line");
        server.send_text(r#"{"type":"file_list","payload":{"entries":[]}}"#);
        settle().await;

        match inbound.try_recv().unwrap() {
            ServerMessage::Output { data, system, .. } => {
                assert_eq!(data, "[SYSTEM] Welcome");
                assert!(system);
            }
            other => panic!("unexpected message {:?}", other),
        }
        match inbound.try_recv().unwrap() {
            ServerMessage::Stream {
                kind, timestamp, ..
            } => {
                assert_eq!(kind, StreamKind::Stdout);
                assert_eq!(timestamp, Some(5));
            }
            other => panic!("unexpected message {:?}", other),
        }
        match inbound.try_recv().unwrap() {
            ServerMessage::Output { data, system, .. } => {
                assert_eq!(data, "plain text line");
                assert!(!system);
            }
            other => panic!("unexpected message {:?}", other),
        }
        match inbound.try_recv().unwrap() {
            ServerMessage::Unrecognized(envelope) => assert_eq!(envelope.frame_type, "file_list"),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_subscriber_does_not_stop_delivery() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        manager.subscribe_lifecycle(|_| panic!("subscriber failure"));
        let mut events = lifecycle_events(&manager);

        manager.connect(URL).unwrap();
        let (connected, _) = wait_for(&mut events, is_connected).await;
        assert!(is_connected(&connected));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let (connector, _servers) = MockConnector::new(vec![], Outcome::Accept);
        let manager = engine(EngineConfig::default(), connector, MockProbe::new(true));
        assert!(matches!(
            manager.connect("not a url"),
            Err(SessionError::InvalidUrl(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }
}
