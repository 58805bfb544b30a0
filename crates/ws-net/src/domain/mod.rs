//! Domain layer for ws-net.

pub mod config;

pub use config::{ClientOptions, ServerConfig};
