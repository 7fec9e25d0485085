//! Server and WebSocket configuration.
//!
//! Every field has a default, so a configuration file only needs the values it
//! changes:
//!
//! ```
//! use routeforge_core::config::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{
//!     "application_name": "inventory",
//!     "prefixes": ["http://127.0.0.1:8080/"],
//!     "default_headers": [["X-Powered-By", "routeforge"]],
//!     "websocket": { "upgrade_timeout_ms": 2000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.max_accept_restarts, 5);
//! assert_eq!(config.websocket.upgrade_timeout_ms, 2000);
//! assert_eq!(config.websocket.receive_buffer_size, 4096);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Limits;
use crate::error::{Error, Result};

fn default_application_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "routeforge".to_string())
}

fn default_max_accept_restarts() -> u32 {
    5
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_max_request_head_bytes() -> usize {
    64 * 1024
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_upgrade_timeout_ms() -> u64 {
    5000
}

fn default_receive_buffer_size() -> usize {
    4096
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

/// Configuration of the connection server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Names the accept thread (`"{application_name}-accept"`).
    pub application_name: String,
    /// Listen endpoints registered when the server is created.
    pub prefixes: Vec<String>,
    /// Headers applied to every response before any handler runs, in order.
    pub default_headers: Vec<(String, String)>,
    /// Emit one `INFO` event per request.
    pub access_log: bool,
    /// Accept failures tolerated before the accept loop stops for good.
    pub max_accept_restarts: u32,
    /// Base delay of the linear restart backoff.
    pub restart_backoff_ms: u64,
    /// Largest accepted request line plus headers.
    pub max_request_head_bytes: usize,
    /// Largest accepted request body.
    pub max_request_body_bytes: usize,
    /// WebSocket session settings.
    pub websocket: WebSocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            prefixes: Vec::new(),
            default_headers: Vec::new(),
            access_log: false,
            max_accept_restarts: default_max_accept_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_request_head_bytes: default_max_request_head_bytes(),
            max_request_body_bytes: default_max_request_body_bytes(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Sets the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Adds a listen endpoint.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Adds a default response header.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Enables or disables access logging.
    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    /// Sets the accept restart budget.
    pub fn with_max_accept_restarts(mut self, restarts: u32) -> Self {
        self.max_accept_restarts = restarts;
        self
    }

    /// Sets the base restart backoff.
    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Replaces the WebSocket settings.
    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    /// Base restart backoff as a duration.
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            max_head_bytes: self.max_request_head_bytes,
            max_body_bytes: self.max_request_body_bytes,
        }
    }
}

/// Configuration of WebSocket sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Time allowed for the connection hand-off and handshake.
    pub upgrade_timeout_ms: u64,
    /// Size of the temporary buffer fragments are received into.
    pub receive_buffer_size: usize,
    /// Largest reassembled message; bigger messages close the session with 1009.
    pub max_message_size: usize,
    /// Suggested ping interval for applications; sessions do not ping on their own.
    pub keep_alive_interval_ms: Option<u64>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
            receive_buffer_size: default_receive_buffer_size(),
            max_message_size: default_max_message_size(),
            keep_alive_interval_ms: None,
        }
    }
}

impl WebSocketConfig {
    /// Upgrade timeout as a duration.
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    /// Sets the upgrade timeout.
    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the receive buffer size. Zero is raised to one byte.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    /// Sets the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(!config.application_name.is_empty());
        assert_eq!(config.max_accept_restarts, 5);
        assert_eq!(config.restart_backoff(), Duration::from_secs(1));
        assert_eq!(config.websocket.upgrade_timeout(), Duration::from_secs(5));
        assert!(config.prefixes.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .with_application_name("svc")
            .with_prefix("http://localhost:9000")
            .with_default_header("Server", "svc")
            .with_access_log(true)
            .with_restart_backoff(Duration::from_millis(10));
        assert_eq!(config.application_name, "svc");
        assert_eq!(config.prefixes, vec!["http://localhost:9000".to_string()]);
        assert_eq!(config.default_headers[0].0, "Server");
        assert!(config.access_log);
        assert_eq!(config.restart_backoff_ms, 10);
    }

    #[test]
    fn test_partial_json() {
        let config = ServerConfig::from_json_str(r#"{"access_log": true}"#).unwrap();
        assert!(config.access_log);
        assert_eq!(config.websocket.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_json() {
        let err = ServerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
