//! Terminal client for a remote command server.
//!
//! Reads commands from stdin, sends them over a self-healing WebSocket link
//! and prints what the server streams back.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use termlink_session::ConnectionManager;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod logging;
mod repl;

use config::ClientConfig;
use display::{render_lifecycle, render_message, Sink};
use logging::TermlinkLogFormatter;
use repl::{parse_input, Input};

const USER_DISCONNECT_REASON: &str = "User disconnected";

/// Terminal client with automatic reconnection
#[derive(Parser, Debug)]
#[command(name = "termlink", version, about = "Terminal client for a remote command server")]
struct Args {
    /// WebSocket endpoint, e.g. ws://localhost:8080/ws/test-room
    #[arg(long)]
    url: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "termlink.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Heartbeat interval, e.g. 25s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Connect timeout, e.g. 10s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Never gate reconnection on the HTTP health endpoint
    #[arg(long)]
    no_health_probe: bool,
}

impl Args {
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(interval) = &self.heartbeat_interval {
            config.heartbeat_interval = **interval;
        }
        if let Some(timeout) = &self.connect_timeout {
            config.connect_timeout = **timeout;
        }
        if self.no_health_probe {
            config.health_probe = false;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("TERMLINK_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("termlink={}", log_level).parse()?)
        .add_directive(format!("termlink_session={}", log_level).parse()?)
        .add_directive(format!("termlink_wire={}", log_level).parse()?);

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(TermlinkLogFormatter::new("termlink".to_string()))
        .init();

    info!("Starting termlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let manager = ConnectionManager::new(config.engine_config());

    manager.subscribe_messages(|message| {
        if let Some((sink, text)) = render_message(message) {
            match sink {
                Sink::Stdout => {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                }
                Sink::Stderr => {
                    let mut err = std::io::stderr().lock();
                    let _ = err.write_all(text.as_bytes());
                    let _ = err.flush();
                }
            }
        }
    });
    manager.subscribe_lifecycle(|event| eprintln!("{}", render_lifecycle(event)));

    manager
        .connect(&config.url)
        .with_context(|| format!("Failed to connect to {}", config.url))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                component_info!("repl", "Interrupted, closing connection");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    component_debug!("repl", "End of input");
                    break;
                };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Reconnect => {
                        manager.reset_reconnection();
                        if manager.is_connected() {
                            eprintln!("* already connected");
                        } else if let Err(e) = manager.connect(&config.url) {
                            component_warn!("repl", "Reconnect refused: {}", e);
                        }
                    }
                    Input::Status => {
                        println!("{}", serde_json::to_string_pretty(&manager.diagnostics())?);
                    }
                    Input::Command(command) => {
                        if !manager.send(&command) {
                            eprintln!("* not connected ({:?}), command dropped", manager.state());
                        }
                    }
                    Input::Empty => {}
                }
            }
        }
    }

    manager.disconnect(USER_DISCONNECT_REASON);
    info!("termlink stopped");
    Ok(())
}
