//! Session error types.

use std::time::Duration;
use termlink_wire::{close_code, WireError};
use thiserror::Error;

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The circuit breaker is refusing attempts
    #[error("circuit open, retry in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Time until a trial attempt is allowed
        retry_after: Duration,
    },
    /// Connection URL could not be used
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Outbound frame could not be encoded
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),
}

impl TransportError {
    /// Close code reported for this error.
    ///
    /// A failed open surfaces as an abnormal closure.
    pub fn close_code(&self) -> u16 {
        close_code::ABNORMAL
    }
}
