//! HTTP Upgrade handshake: request validation, response building and the
//! `Sec-WebSocket-Accept` digest.
//!
//! # How the handshake works (for beginners)
//!
//! The client sends an ordinary HTTP `GET` with a few extra headers, the most
//! important being `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.  The
//! server proves it understood the request by appending a fixed GUID to that
//! key, hashing the result with SHA-1 and sending the base64 digest back in
//! `Sec-WebSocket-Accept`.  A plain HTTP server would never produce that
//! value, so the client knows it is really talking WebSocket.
//!
//! ```text
//! Client                                   Server
//!   |  GET /chat HTTP/1.1                    |
//!   |  Sec-WebSocket-Key: dGhl...            |
//!   | -------------------------------------> |
//!   |  HTTP/1.1 101 Switching Protocols      |
//!   |  Sec-WebSocket-Accept: s3pP...         |
//!   | <------------------------------------- |
//!   |        (binary frames from now on)     |
//! ```
//!
//! Everything in this module works on `&str`; reading the head off a socket
//! is the job of the networking crate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Upper bound on the size of a request or response head, blank line included.
pub const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

/// Default `User-Agent` sent by [`ClientHandshake`].
pub const DEFAULT_USER_AGENT: &str = "ws-net";

/// Reasons a handshake can fail.
///
/// For the server-side variants the `Display` text is exactly the body of the
/// `400 Bad Request` response sent back to the peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    // ── Server side: request validation, in check order ──────────────────────
    #[error("Received unsupported request type")]
    UnsupportedRequest,

    #[error("Received request without \"Connection: Upgrade\" header")]
    MissingConnectionUpgrade,

    #[error("Received request without \"Upgrade: websocket\" header")]
    MissingUpgradeWebsocket,

    #[error("Did not receive valid \"Host\" header")]
    MissingHost,

    #[error("Did not receive websocket version header value of 13")]
    UnsupportedVersion,

    #[error("Received invalid websocket request (missing key)")]
    MissingKey,

    /// The head did not end within [`MAX_HANDSHAKE_LEN`] bytes.
    #[error("Handshake exceeds {max} bytes")]
    TooLarge { max: usize },

    // ── Client side: response validation ────────────────────────────────────
    #[error("Unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),

    #[error("Invalid response code: {0:?}")]
    InvalidStatus(String),

    #[error("Invalid HTTP message: {0:?}")]
    InvalidReason(String),

    #[error("WebSocket Upgrade header not \"websocket\"")]
    UpgradeNotWebsocket,

    #[error("WebSocket Connection header not \"Upgrade\"")]
    ConnectionNotUpgrade,

    #[error("Invalid WebSocket acceptance")]
    InvalidAccept {
        expected: String,
        actual: Option<String>,
    },
}

// ── Key material ──────────────────────────────────────────────────────────────

/// Computes `base64(SHA1(key + GUID))`.
///
/// ```rust
/// assert_eq!(
///     ws_core::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Generates a fresh client key: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

// ── Server side ───────────────────────────────────────────────────────────────

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    pub host: String,
    pub key: String,
    pub origin: Option<String>,
    /// `Sec-WebSocket-*` lines other than Version 13 and Key, as `"Name: value"`.
    /// Extensions and subprotocols are never negotiated; these are only logged.
    pub extra_headers: Vec<String>,
}

impl HandshakeRequest {
    /// Validates a raw request head (request line + headers).
    ///
    /// Checks run in a fixed order and the first failure wins, so a peer
    /// missing several headers always gets the same message.
    ///
    /// # Errors
    ///
    /// One of the server-side [`HandshakeError`] variants.
    pub fn parse(raw: &str) -> Result<Self, HandshakeError> {
        let mut lines = raw.lines();
        let path = lines
            .next()
            .and_then(parse_request_line)
            .ok_or(HandshakeError::UnsupportedRequest)?;
        let headers = parse_headers(lines);

        if !has_token(&headers, "connection", "upgrade") {
            return Err(HandshakeError::MissingConnectionUpgrade);
        }
        if !has_value(&headers, "upgrade", "websocket") {
            return Err(HandshakeError::MissingUpgradeWebsocket);
        }
        let host = header(&headers, "host")
            .filter(|v| is_single_token(v))
            .ok_or(HandshakeError::MissingHost)?;

        let mut version_ok = false;
        let mut key = None;
        let mut extra_headers = Vec::new();
        for (name, value) in headers.iter().copied() {
            if !starts_with_ignore_case(name, "sec-websocket-") {
                continue;
            }
            if name.eq_ignore_ascii_case("sec-websocket-version") && value == WEBSOCKET_VERSION {
                version_ok = true;
            } else if name.eq_ignore_ascii_case("sec-websocket-key") && is_single_token(value) {
                key = Some(value);
            } else {
                extra_headers.push(format!("{name}: {value}"));
            }
        }
        if !version_ok {
            return Err(HandshakeError::UnsupportedVersion);
        }
        let key = key.ok_or(HandshakeError::MissingKey)?;

        let origin = header(&headers, "origin")
            .filter(|v| is_single_token(v))
            .map(str::to_owned);

        Ok(Self {
            path: path.to_owned(),
            host: host.to_owned(),
            key: key.to_owned(),
            origin,
            extra_headers,
        })
    }

    /// The `101 Switching Protocols` response accepting this request.
    pub fn response(&self) -> String {
        switching_protocols_response(&accept_key(&self.key))
    }
}

/// Builds the `101 Switching Protocols` response head.
pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// Builds a complete `400 Bad Request` response whose body is `message`.
pub fn bad_request_response(message: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {message}",
        message.len()
    )
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Inputs for the client's upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub origin: Option<String>,
    pub user_agent: String,
    /// Additional headers appended after the required ones.
    pub headers: Vec<(String, String)>,
}

impl ClientRequestOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            origin: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: Vec::new(),
        }
    }

    /// Value of the `Host` header; the port is left out when it is 80.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// The client half of the handshake: the request to send and the key needed
/// to check the server's answer.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    request: String,
}

impl ClientHandshake {
    /// Builds a request with a freshly generated key.
    pub fn new(options: &ClientRequestOptions) -> Self {
        Self::with_key(options, generate_key())
    }

    /// Builds a request with a caller-supplied key.
    pub fn with_key(options: &ClientRequestOptions, key: String) -> Self {
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\
             User-Agent: {agent}\r\n",
            path = options.path,
            host = options.host_header(),
            agent = options.user_agent,
        );
        if let Some(origin) = options.origin.as_deref().filter(|o| !o.is_empty()) {
            request.push_str(&format!("Origin: {origin}\r\n"));
        }
        for (name, value) in &options.headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        Self { key, request }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The full request head, ready to write to the socket.
    pub fn request(&self) -> &str {
        &self.request
    }

    /// Checks the server's response head.
    ///
    /// # Errors
    ///
    /// One of the client-side [`HandshakeError`] variants, reporting the
    /// first problem found in status line, `Upgrade`, `Connection`, accept
    /// order.
    pub fn verify_response(&self, raw: &str) -> Result<(), HandshakeError> {
        let mut lines = raw.lines();
        let mut status = lines.next().unwrap_or_default().split_whitespace();

        let protocol = status.next().unwrap_or_default();
        if protocol != "HTTP/1.1" {
            return Err(HandshakeError::UnsupportedProtocol(protocol.to_string()));
        }
        let code = status.next().unwrap_or_default();
        if code != "101" {
            return Err(HandshakeError::InvalidStatus(code.to_string()));
        }
        if status.next().is_none() {
            return Err(HandshakeError::InvalidReason(String::new()));
        }

        let headers = parse_headers(lines);
        if !has_value(&headers, "upgrade", "websocket") {
            return Err(HandshakeError::UpgradeNotWebsocket);
        }
        if !has_token(&headers, "connection", "upgrade") {
            return Err(HandshakeError::ConnectionNotUpgrade);
        }

        let expected = accept_key(&self.key);
        let actual = header(&headers, "sec-websocket-accept");
        if actual != Some(expected.as_str()) {
            return Err(HandshakeError::InvalidAccept {
                expected,
                actual: actual.map(str::to_owned),
            });
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Extracts `<path>` from `GET <path> HTTP/1.1`.
fn parse_request_line(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(path), Some("HTTP/1.1"), None) => Some(path),
        _ => None,
    }
}

/// Collects `Name: value` pairs up to the first blank line.  Lines without a
/// colon are skipped.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(&'a str, &'a str)> {
    lines
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect()
}

fn header<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

fn has_value(headers: &[(&str, &str)], name: &str, expected: &str) -> bool {
    headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case(name) && v.eq_ignore_ascii_case(expected))
}

/// True when some `name` header lists `token` in its comma-separated value,
/// e.g. `Connection: keep-alive, Upgrade`.
fn has_token(headers: &[(&str, &str)], name: &str, token: &str) -> bool {
    headers.iter().any(|(n, v)| {
        n.eq_ignore_ascii_case(name) && v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

fn is_single_token(value: &str) -> bool {
    !value.is_empty() && !value.contains(char::is_whitespace)
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
