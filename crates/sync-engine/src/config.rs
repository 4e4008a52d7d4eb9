//! Sync engine configuration.

use std::time::Duration;

use anyhow::Result;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Client identifier carried in logs, e.g. to correlate several open
    /// run views against the control plane's own logs.
    pub client_id: String,

    /// Control plane base URL for HTTP commands.
    pub server_url: String,

    /// Base URL for the live event channel.
    pub ws_url: String,

    /// Initial reconnect delay.
    pub reconnect_base: Duration,

    /// Ceiling on the reconnect delay.
    pub reconnect_cap: Duration,

    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// Retention window of the duplicate-event filter, in keys.
    pub dedup_capacity: usize,

    /// Timeout for HTTP commands.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("FLOWDECK_CLIENT_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let server_url = std::env::var("FLOWDECK_SERVER_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());

        // The channel usually lives on the same host as the HTTP API.
        let ws_url = std::env::var("FLOWDECK_WS_URL")
            .unwrap_or_else(|_| "ws://localhost:8000".to_string());

        let reconnect_base_ms: u64 = std::env::var("FLOWDECK_RECONNECT_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1_000);

        let reconnect_cap_ms: u64 = std::env::var("FLOWDECK_RECONNECT_CAP_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        let max_reconnect_attempts: u32 = std::env::var("FLOWDECK_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let dedup_capacity: usize = std::env::var("FLOWDECK_DEDUP_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4_096);

        let request_timeout_secs: u64 = std::env::var("FLOWDECK_REQUEST_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            client_id,
            server_url,
            ws_url,
            reconnect_base: Duration::from_millis(reconnect_base_ms),
            reconnect_cap: Duration::from_millis(reconnect_cap_ms),
            max_reconnect_attempts,
            dedup_capacity,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            server_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000".to_string(),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            dedup_capacity: 4_096,
            request_timeout: Duration::from_secs(30),
        }
    }
}
