//! Rendering of engine output for the terminal.

use termlink_session::{LifecycleEvent, ServerMessage};
use termlink_wire::StreamKind;

/// Destination for a rendered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Stdout,
    Stderr,
}

/// Route a server message to a terminal stream.
///
/// Stream start/end markers carry no text and render nothing.
pub fn render_message(message: &ServerMessage) -> Option<(Sink, String)> {
    let text = message.text()?;
    let sink = match message {
        ServerMessage::Stream {
            kind: StreamKind::Stderr,
            ..
        } => Sink::Stderr,
        _ => Sink::Stdout,
    };
    Some((sink, text))
}

/// One status line per lifecycle event
pub fn render_lifecycle(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::Connected { url } => format!("* connected to {}", url),
        LifecycleEvent::Disconnected {
            code,
            reason,
            duration_ms,
            network_block_suspected,
            ..
        } => {
            let code = code.map_or_else(|| "-".to_string(), |c| c.to_string());
            let mut line = format!(
                "* disconnected ({}): {} after {}ms",
                code, reason, duration_ms
            );
            if *network_block_suspected {
                line.push_str(" [network may be blocking WebSocket traffic]");
            }
            line
        }
        LifecycleEvent::Error {
            message,
            health_check_failed,
            ..
        } => {
            if *health_check_failed {
                format!("* error: {} (health check failed)", message)
            } else {
                format!("* error: {}", message)
            }
        }
        LifecycleEvent::Reconnecting {
            attempt,
            max_attempts,
            delay_ms,
            strategy,
        } => format!(
            "* reconnecting in {}ms (attempt {}/{}, {:?})",
            delay_ms, attempt, max_attempts, strategy
        ),
        LifecycleEvent::ReconnectDelayed { delay_ms } => {
            format!("* server unavailable, next check in {}ms", delay_ms)
        }
        LifecycleEvent::ReconnectFailed { attempts } => format!(
            "* gave up after {} attempts, type :reconnect to try again",
            attempts
        ),
    }
}
