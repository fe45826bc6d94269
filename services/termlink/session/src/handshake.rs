//! Client handshake sent shortly after the transport opens.

use termlink_wire::{ClientMetadata, OutboundFrame};
use tracing::debug;
use uuid::Uuid;

use crate::session::now_millis;

/// Value of the metadata `type` field
pub const CLIENT_CONNECTED: &str = "client_connected";

/// Generate a per-session client identifier
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build the `connection` frame announcing this client
pub fn build_connection_frame(user_agent: &str, client_id: &str) -> OutboundFrame {
    let timestamp = now_millis();
    debug!("Building handshake for client {}", client_id);
    OutboundFrame::Connection {
        payload: ClientMetadata {
            kind: CLIENT_CONNECTED.to_string(),
            timestamp,
            user_agent: user_agent.to_string(),
            client_id: client_id.to_string(),
        },
        timestamp,
    }
}
