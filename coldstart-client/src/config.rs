use std::time::Duration;

use tracing::info;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_WS_URL: &str = "ws://localhost:9001";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the session talks to, and how patiently.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub reconnect_delay: Duration,
    pub join_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            ws_url: ws_url.into(),
            reconnect_delay: RECONNECT_DELAY,
            join_timeout: JOIN_TIMEOUT,
        }
    }

    /// Priority: runtime env -> default
    pub fn from_env() -> Self {
        let api_url = std::env::var("COLDSTART_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let ws_url = std::env::var("COLDSTART_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());

        info!(api = %api_url, ws = %ws_url, "Using ColdStart server URLs");
        Self::new(api_url, ws_url)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL, DEFAULT_WS_URL)
    }
}
