//! Event kinds that handlers can be registered for.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Every event a connection or a server can emit.
///
/// The first five are per-connection and fire once per complete message or
/// control frame.  `ClientConnect` and `ClientDisconnect` are server-level:
/// they fire once per connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
    ClientConnect,
    ClientDisconnect,
}

/// Returned when parsing an unknown event name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown event kind: {0:?}")]
pub struct UnknownEventKind(pub String);

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Text,
        EventKind::Binary,
        EventKind::Ping,
        EventKind::Pong,
        EventKind::Close,
        EventKind::ClientConnect,
        EventKind::ClientDisconnect,
    ];

    /// `true` for events fired by the server registry rather than by a
    /// connection's receive loop.
    pub fn is_server_level(self) -> bool {
        matches!(self, EventKind::ClientConnect | EventKind::ClientDisconnect)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Binary => "binary",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::Close => "close",
            EventKind::ClientConnect => "client_connect",
            EventKind::ClientDisconnect => "client_disconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}
