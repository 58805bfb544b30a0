//! Domain layer: pure protocol rules with no I/O.

pub mod event;
pub mod fragment;
pub mod role;

/// Unique identifier assigned to every connection when its handshake completes.
pub type ConnectionId = uuid::Uuid;
