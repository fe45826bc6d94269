//! Encoding and decoding of text frames.

use crate::error::WireError;
use crate::frame::{Envelope, InboundFrame, OutboundFrame, StreamKind};
use tracing::trace;

/// Decode one inbound text frame.
///
/// Any well-formed envelope decodes; types outside the known set come back as
/// [`InboundFrame::Unrecognized`]. Text that is not an envelope, or a
/// `system_message` without its message, is an error.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, WireError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.frame_type.is_empty() {
        return Err(WireError::MissingType);
    }

    trace!("Decoded {} frame ({} bytes)", envelope.frame_type, text.len());

    let frame = match envelope.frame_type.as_str() {
        "ping" => InboundFrame::Ping {
            timestamp: envelope.timestamp,
        },
        "pong" => InboundFrame::Pong {
            timestamp: envelope.timestamp,
        },
        "system_message" => {
            let message = envelope
                .payload
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(|m| m.as_str())
                .ok_or(WireError::MissingField {
                    frame: "system_message",
                    field: "message",
                })?;
            InboundFrame::SystemMessage {
                message: message.to_string(),
            }
        }
        tag => match StreamKind::from_tag(tag) {
            Some(kind) => InboundFrame::Stream {
                kind,
                payload: envelope.payload,
                timestamp: envelope.timestamp,
            },
            None => InboundFrame::Unrecognized(envelope),
        },
    };

    Ok(frame)
}

/// Encode an outbound frame as JSON text.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, WireError> {
    serde_json::to_string(frame).map_err(|e| WireError::Encode(e.to_string()))
}
