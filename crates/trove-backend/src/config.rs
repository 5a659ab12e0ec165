//! Backend configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trove_core::constants::BITCOIN_XPUB_VERSION;

/// Configuration for one coin's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, without a trailing slash.
    pub endpoint: String,
    /// Version bytes the backend expects on subscribed xpubs.
    pub xpub_version: u32,
    /// Only report history after this date (`YYYY-MM-DD`).
    pub after: String,
    /// Unused addresses the backend scans past the last used one.
    pub look_ahead: u32,
    /// First address index to scan.
    pub first_index: u32,
    /// Minimum delay between long-poll requests, in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-request timeout, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000".to_string(),
            xpub_version: BITCOIN_XPUB_VERSION,
            after: "2014-01-01".to_string(),
            look_ahead: 20,
            first_index: 0,
            poll_interval_ms: 1_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl BackendConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}
