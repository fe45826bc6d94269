//! WebSocket lifecycle, heartbeat, circuit breaker, retry scheduling and
//! dispatch for termlink.
//!
//! This crate is the connection resilience engine of the terminal client. It
//! opens, monitors and repairs the transport to the remote command server,
//! tells transient blips apart from persistent failures (including
//! firewall-like blocking), and exposes a publish/subscribe surface so the
//! rest of the application never deals with socket lifecycle.
//!
//! ## Features
//!
//! - **Connection Manager**: single owner of transport and resilience state
//! - **Heartbeat**: PING/PONG liveness detection with forced close
//! - **Circuit Breaker**: stops attempts after repeated failures until a cooldown elapses
//! - **Retry Scheduling**: standard or aggressive backoff with a bounded budget
//! - **Failure Classification**: detects network blocking from recent attempts
//! - **Health Probe**: HTTP side-channel check before risky attempts
//! - **Dispatch**: message and lifecycle subscriptions keyed by opaque ids
//!
//! ## Example
//!
//! ```rust,no_run
//! use termlink_session::{ConnectionManager, EngineConfig, LifecycleEvent};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = ConnectionManager::new(EngineConfig::default());
//!
//! manager.subscribe_lifecycle(|event| match event {
//!     LifecycleEvent::Connected { url } => println!("Connected to {}", url),
//!     LifecycleEvent::Disconnected { code, reason, .. } => {
//!         println!("Disconnected ({:?}): {}", code, reason)
//!     }
//!     other => println!("{:?}", other),
//! });
//! manager.subscribe_messages(|message| {
//!     if let Some(text) = message.text() {
//!         print!("{}", text);
//!     }
//! });
//!
//! manager.connect("ws://localhost:8080/ws/test-room")?;
//! manager.send("ls -la");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit_breaker;
pub mod dispatch;
pub mod error;
pub mod failure_tracker;
pub mod handshake;
pub mod health;
pub mod keepalive;
pub mod manager;
pub mod retry;
pub mod session;
pub mod transport;

// Re-export main types
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use dispatch::{DispatchRegistry, SubscriptionId};
pub use error::{SessionError, TransportError};
pub use failure_tracker::{AttemptRecord, FailureClassifier};
pub use health::{health_url, HealthProbe, HttpHealthProbe};
pub use keepalive::{build_ping, build_pong, HeartbeatAction, HeartbeatState};
pub use manager::ConnectionManager;
pub use retry::{aggressive_delay, standard_delay, RetryPolicy, RetryStrategy};
pub use session::{
    now_millis, ConnectionState, Diagnostics, EngineConfig, LifecycleEvent, ServerMessage,
};
pub use transport::{
    Connector, TransportCommand, TransportEvent, TransportHandle, WebSocketConnector,
};
