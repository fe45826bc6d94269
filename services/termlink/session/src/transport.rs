//! WebSocket transport.
//!
//! A transport is a pair of channels: commands flow in (text frames, close),
//! events flow out (text frames, the final close). The engine never touches
//! the socket itself, so tests can swap in an in-memory [`Connector`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use termlink_wire::close_code;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;

/// Code reported when the peer's close frame carried none
const NO_STATUS: u16 = 1005;

/// Instruction for an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write one text frame
    Text(String),
    /// Send a close frame and shut down
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Something that happened on an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame arrived
    Text(String),
    /// The transport is gone; always the last event
    Closed {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason from the peer or the local error
        reason: String,
        /// Whether a close frame was exchanged
        was_clean: bool,
    },
}

/// Channels of one open transport
#[derive(Debug)]
pub struct TransportHandle {
    /// Outbound commands
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    /// Inbound events
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`. Resolves once the connection is usable.
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError>;
}

/// `tokio-tungstenite` implementation of [`Connector`]
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError> {
        info!("Connecting to {}", url);
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("WebSocket upgrade completed with status {}", response.status());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, cmd_rx, event_tx));

        Ok(TransportHandle {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

/// Move frames between the socket and the handle's channels until either
/// side closes.
async fn pump<S>(
    ws_stream: S,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    let closed = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Text(text)) => {
                    trace!("Writing {} byte frame", text.len());
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("WebSocket write failed: {}", e);
                        break TransportEvent::Closed {
                            code: Some(close_code::ABNORMAL),
                            reason: e.to_string(),
                            was_clean: false,
                        };
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    debug!("Closing WebSocket ({}: {})", code, reason);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    let _ = write.close().await;
                    return;
                }
                None => {
                    debug!("Transport handle dropped, closing WebSocket");
                    let _ = write.close().await;
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Text(text)).is_err() {
                        let _ = write.close().await;
                        return;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (Some(NO_STATUS), String::new()),
                    };
                    info!("WebSocket closed by server (code {:?})", code);
                    break TransportEvent::Closed { code, reason, was_clean: true };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break TransportEvent::Closed {
                        code: Some(close_code::ABNORMAL),
                        reason: e.to_string(),
                        was_clean: false,
                    };
                }
                None => {
                    info!("WebSocket stream ended");
                    break TransportEvent::Closed {
                        code: Some(close_code::ABNORMAL),
                        reason: String::new(),
                        was_clean: false,
                    };
                }
            },
        }
    };

    let _ = events.send(closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn pumped() -> (TransportHandle, WebSocketStream<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(client, cmd_rx, event_tx));
        (
            TransportHandle {
                commands: cmd_tx,
                events: event_rx,
            },
            server,
        )
    }

    #[tokio::test]
    async fn test_text_frames_flow_both_ways() {
        let (mut handle, mut server) = pumped().await;

        handle
            .commands
            .send(TransportCommand::Text(r#"{"type":"ping"}"#.to_string()))
            .unwrap();
        let received = server.next().await.unwrap().unwrap();
        assert_eq!(received, Message::Text(r#"{"type":"ping"}"#.to_string()));

        server.send(Message::Text("hello".to_string())).await.unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(TransportEvent::Text("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn test_server_close_is_reported() {
        let (mut handle, mut server) = pumped().await;

        server
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("bye"),
            })))
            .await
            .unwrap();

        assert_eq!(
            handle.events.recv().await,
            Some(TransportEvent::Closed {
                code: Some(1000),
                reason: "bye".to_string(),
                was_clean: true,
            })
        );
    }

    #[tokio::test]
    async fn test_local_close_sends_close_frame() {
        let (handle, mut server) = pumped().await;

        handle
            .commands
            .send(TransportCommand::Close {
                code: 1001,
                reason: "Going away".to_string(),
            })
            .unwrap();

        match server.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason, "Going away");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_is_abnormal() {
        let (mut handle, server) = pumped().await;
        drop(server);

        match handle.events.recv().await {
            Some(TransportEvent::Closed { code, was_clean, .. }) => {
                assert_eq!(code, Some(1006));
                assert!(!was_clean);
            }
            other => panic!("expected close event, got {:?}", other),
        }
    }
}
