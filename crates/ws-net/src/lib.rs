//! ws-net library crate.
//!
//! Async WebSocket (RFC 6455) networking on tokio: a multi-connection server,
//! the per-connection receive/dispatch engine, and a client-side `connect`.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! TCP socket (or any AsyncRead + AsyncWrite stream)
//!         ↕
//! [ws-net]
//!   ├── domain/           Pure types: ServerConfig, ClientOptions
//!   ├── application/      Event dispatcher and connection registry
//!   └── infrastructure/
//!         ├── frame_io/   Frame and handshake-head reading over async streams
//!         ├── connection/ Receive loop, writer task, default control handling
//!         ├── server/     Accept loop, handshake, registry bookkeeping
//!         ├── client/     connect(): client handshake over TCP
//!         └── storage/    TOML configuration file loading
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `ws-core` only.
//! - `infrastructure` depends on all other layers plus `tokio`.
//!
//! # For beginners: how a message travels
//!
//! Bytes arrive on the socket and are turned into frames by `frame_io`.
//! The connection feeds each frame through `ws_core::FragmentState`, which
//! returns complete messages.  Each message is handed to the dispatcher,
//! which calls every handler registered for that event kind, in the order
//! they were registered.  Replies go through `Connection::send_frame`, which
//! queues encoded bytes for the connection's single writer task.

/// Domain layer: configuration types (no I/O).
pub mod domain;

/// Application layer: handler dispatch and the live-connection registry.
pub mod application;

/// Infrastructure layer: sockets, tasks and files.
pub mod infrastructure;

pub use domain::config::{ClientOptions, ServerConfig};
pub use infrastructure::client::{connect, connect_with_stream, ClientError};
pub use infrastructure::connection::{Connection, ConnectionError};
pub use infrastructure::server::{Server, ServerError};
pub use infrastructure::storage::{load_config, ConfigError};
pub use ws_core::{EventKind, Opcode, Role};
