//! TOML configuration loading for the `ws-server` binary.
//!
//! # What is TOML? (for beginners)
//!
//! TOML is a small configuration format of `key = value` lines:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4568
//! greeting = "Welcome!"
//! ```
//!
//! `serde` turns that text into a [`ServerConfig`] automatically.  Keys that
//! are missing from the file fall back to their defaults, and a missing file
//! means "all defaults".

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::config::ServerConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error other than "not found".
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads a [`ServerConfig`] from `path`.
///
/// Returns [`ServerConfig::default`] if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file exists but cannot be read,
/// [`ConfigError::Parse`] if it is not valid TOML for this schema.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
