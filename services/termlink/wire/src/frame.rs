//! Frame types carried over the transport.
//!
//! Every frame is a JSON object `{ type, payload?, timestamp? }`. Inbound
//! frames are decoded once into [`InboundFrame`]; outbound frames are built
//! from [`OutboundFrame`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Client identifier carried on ping/pong frames
pub const CLIENT_ID: &str = "http-ssh-client";

/// Generic frame envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type tag
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Optional sender timestamp
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<i64>,
}

/// Accept integer or float timestamps; anything else is dropped.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))))
}

/// Pass-through frame kinds delivered to message subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Result of a completed command
    CommandOutput,
    /// Standard output chunk
    Stdout,
    /// Standard error chunk
    Stderr,
    /// Command started
    CommandStart,
    /// Command finished
    CommandEnd,
}

impl StreamKind {
    /// Parse a wire type tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "command_output" => Some(Self::CommandOutput),
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "command_start" => Some(Self::CommandStart),
            "command_end" => Some(Self::CommandEnd),
            _ => None,
        }
    }

    /// Wire type tag
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::CommandOutput => "command_output",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::CommandStart => "command_start",
            Self::CommandEnd => "command_end",
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Liveness probe from the server; must be answered with a pong
    Ping {
        /// Server timestamp, if any
        timestamp: Option<i64>,
    },
    /// Answer to one of our pings
    Pong {
        /// Server timestamp, if any
        timestamp: Option<i64>,
    },
    /// Server notice to be shown as output
    SystemMessage {
        /// Notice text
        message: String,
    },
    /// Command stream frame, passed through untouched
    Stream {
        /// Frame kind
        kind: StreamKind,
        /// Frame payload
        payload: Option<Value>,
        /// Sender timestamp
        timestamp: Option<i64>,
    },
    /// Well-formed envelope with a type we do not know
    Unrecognized(Envelope),
}

/// Payload of an outbound `command` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Command line to execute
    pub command: String,
    /// Send time, ms since the Unix epoch
    pub timestamp: i64,
}

/// Metadata sent in the `connection` handshake frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Always `client_connected`
    #[serde(rename = "type")]
    pub kind: String,
    /// Send time, ms since the Unix epoch
    pub timestamp: i64,
    /// Client software identification
    pub user_agent: String,
    /// Per-session client identifier
    pub client_id: String,
}

/// Frames the client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Execute a command on the server
    Command {
        /// Command payload
        payload: CommandPayload,
    },
    /// Handshake sent shortly after the transport opens
    Connection {
        /// Client metadata
        payload: ClientMetadata,
        /// Send time, ms since the Unix epoch
        timestamp: i64,
    },
    /// Heartbeat probe
    Ping {
        /// Send time, ms since the Unix epoch
        timestamp: i64,
        /// Client identifier
        client_id: String,
    },
    /// Answer to a server ping
    Pong {
        /// Send time, ms since the Unix epoch
        timestamp: i64,
        /// Client identifier
        client_id: String,
    },
}

impl OutboundFrame {
    /// Build a `command` frame
    pub fn command(command: impl Into<String>, timestamp: i64) -> Self {
        Self::Command {
            payload: CommandPayload {
                command: command.into(),
                timestamp,
            },
        }
    }

    /// Build a `ping` frame
    pub fn ping(timestamp: i64) -> Self {
        Self::Ping {
            timestamp,
            client_id: CLIENT_ID.to_string(),
        }
    }

    /// Build a `pong` frame
    pub fn pong(timestamp: i64) -> Self {
        Self::Pong {
            timestamp,
            client_id: CLIENT_ID.to_string(),
        }
    }

    /// Wire type tag of this frame
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Connection { .. } => "connection",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}
