//! Server and client configuration types.
//!
//! [`ServerConfig`] is read from a TOML file (see
//! [`crate::infrastructure::storage`]) and then overridden by CLI flags.
//! Every field has a serde default, so an empty file, a partial file, or no
//! file at all all yield a working configuration.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4568
//! handshake_timeout_secs = 5
//! ```

use std::time::Duration;

use serde::Deserialize;
use ws_core::protocol::frame::DEFAULT_MAX_PAYLOAD_LEN;
use ws_core::protocol::handshake::{ClientRequestOptions, DEFAULT_USER_AGENT};

/// Runtime settings for [`crate::Server`] and the `ws-server` binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.  `127.0.0.1` accepts local connections only.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.  `0` lets the OS pick a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest frame payload or reassembled message accepted from a peer.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Seconds a new connection may take to send its upgrade request.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Text the demo server sends back for every text message.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ServerConfig {
    /// | Field                  | Default      |
    /// |------------------------|--------------|
    /// | host                   | `127.0.0.1`  |
    /// | port                   | `4568`       |
    /// | max_payload_len        | 16 MiB       |
    /// | handshake_timeout_secs | `10`         |
    /// | log_level              | `"info"`     |
    /// | greeting               | `"Hello!"`   |
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_len: default_max_payload_len(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            log_level: default_log_level(),
            greeting: default_greeting(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4568
}
fn default_max_payload_len() -> usize {
    DEFAULT_MAX_PAYLOAD_LEN
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_greeting() -> String {
    "Hello!".to_string()
}

/// Options for [`crate::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Request path, e.g. `/chat`.
    pub path: String,
    /// Sent as the `Origin` header when set and non-empty.
    pub origin: Option<String>,
    pub user_agent: String,
    /// Extra request headers, appended after the required ones.
    pub headers: Vec<(String, String)>,
    /// Largest frame payload or reassembled message accepted from the server.
    pub max_payload_len: usize,
}

impl ClientOptions {
    /// Combines these options with the target address into the inputs the
    /// handshake builder needs.
    pub fn request_options(&self, host: &str, port: u16) -> ClientRequestOptions {
        ClientRequestOptions {
            host: host.to_string(),
            port,
            path: self.path.clone(),
            origin: self.origin.clone(),
            user_agent: self.user_agent.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            origin: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: Vec::new(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}
