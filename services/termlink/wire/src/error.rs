//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame text is not a JSON envelope
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Envelope has an empty `type`
    #[error("missing frame type")]
    MissingType,

    /// Recognized frame type whose payload lacks a required field
    #[error("{frame} frame missing field `{field}`")]
    MissingField {
        /// Frame type
        frame: &'static str,
        /// Name of the missing payload field
        field: &'static str,
    },

    /// Outbound frame could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}
