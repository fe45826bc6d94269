//! JSON frame envelope, frame types, and close-code reasons for termlink.
//!
//! This crate provides the application-level message protocol spoken between
//! the terminal client and the remote command server over a WebSocket.
//!
//! ## Wire Format
//!
//! Each WebSocket text message carries exactly one JSON envelope:
//!
//! ```text
//! { "type": "<frame type>", "payload": { ... }, "timestamp": <number> }
//! ```
//!
//! `payload` and `timestamp` are optional. Inbound frames are decoded once at
//! the boundary into [`InboundFrame`], a tagged union with an explicit
//! [`InboundFrame::Unrecognized`] variant for well-formed envelopes of unknown
//! type.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod close_code;
pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{decode_inbound, encode_outbound};
pub use error::WireError;
pub use frame::{
    ClientMetadata, CommandPayload, Envelope, InboundFrame, OutboundFrame, StreamKind, CLIENT_ID,
};
