//! Side-channel HTTP health probe.
//!
//! Before reconnecting to an endpoint that has been failing, the engine asks
//! the server's `/health` route whether it is up at all. The probe is only a
//! hint; see the connection manager for when it may block an attempt.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::SessionError;

/// Liveness check against the server
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the server behind `ws_url` reports healthy
    async fn check(&self, ws_url: &str) -> bool;
}

/// Derive the health endpoint for a WebSocket URL.
///
/// `ws` becomes `http` and `wss` becomes `https`; the path is replaced by
/// `/health` and any query or fragment is dropped.
pub fn health_url(ws_url: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(ws_url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(SessionError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::InvalidUrl(format!("cannot use scheme '{}'", scheme)))?;
    url.set_path("/health");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// `reqwest` implementation of [`HealthProbe`]
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// Create a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, ws_url: &str) -> bool {
        let url = match health_url(ws_url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Health check skipped: {}", e);
                return false;
            }
        };

        match self.client.get(url.clone()).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                debug!("Health check {} returned {}", url, response.status());
                healthy
            }
            Err(e) => {
                warn!("Health check {} failed: {}", url, e);
                false
            }
        }
    }
}
