//! # ws-core
//!
//! Shared library for WS-Net containing the RFC 6455 frame codec, the
//! handshake negotiator, and the per-connection fragmentation state machine.
//!
//! This crate is used by both the server and the client side of `ws-net`.
//! It has zero dependencies on sockets, async runtimes, or logging: every
//! function here works on byte slices and strings, which makes the protocol
//! rules testable without a network.
//!
//! # Architecture overview (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP request.  The client
//! asks the server to "upgrade" the connection; if the server agrees, both
//! sides stop speaking HTTP and start exchanging small binary *frames* over
//! the same TCP socket.
//!
//! This crate (`ws-core`) defines:
//!
//! - **`protocol`** – How bytes travel over the network.  `frame` encodes and
//!   decodes the binary framing format (2–14 byte header + payload), and
//!   `handshake` parses and builds the HTTP Upgrade exchange.
//!
//! - **`domain`** – Pure protocol logic with no I/O.  The most important piece
//!   is `FragmentState`: it decides whether a frame is legal given what came
//!   before it, and reassembles fragmented messages.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ws_core::Frame` instead of `ws_core::protocol::frame::Frame`.
pub use domain::event::EventKind;
pub use domain::fragment::{FragmentState, Message};
pub use domain::role::Role;
pub use domain::ConnectionId;
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError, FrameHeader, Opcode};
pub use protocol::handshake::{accept_key, ClientHandshake, HandshakeError, HandshakeRequest};
