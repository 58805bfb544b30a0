//! ws-server: demo WebSocket greeting server.
//!
//! Accepts WebSocket connections and answers every text message with a fixed
//! greeting (default `"Hello!"`).  Connects and disconnects are logged.
//! Ctrl+C stops the server.
//!
//! # Usage
//!
//! ```text
//! ws-server [OPTIONS]
//!
//! Options:
//!   --host <HOST>          Interface to bind [default: 127.0.0.1]
//!   --port <PORT>          TCP port to listen on [default: 4568]
//!   --config <PATH>        TOML configuration file
//!   --greeting <TEXT>      Reply sent for every text message [default: Hello!]
//! ```
//!
//! # Configuration precedence
//!
//! CLI flags (or their environment variables) override values from the
//! `--config` file, which override the built-in defaults.
//!
//! | Variable    | Flag         |
//! |-------------|--------------|
//! | `WS_HOST`   | `--host`     |
//! | `WS_PORT`   | `--port`     |
//! | `WS_CONFIG` | `--config`   |
//!
//! Log verbosity comes from `RUST_LOG`, falling back to `log_level` from the
//! configuration (default `info`).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ws_net::{load_config, EventKind, Server, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Demo WebSocket server that greets every text message.
#[derive(Debug, Parser)]
#[command(name = "ws-server", about = "RFC 6455 WebSocket greeting server", version)]
struct Cli {
    /// IP address or hostname to bind.
    #[arg(long, env = "WS_HOST")]
    host: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "WS_PORT")]
    port: Option<u16>,

    /// Path to a TOML configuration file.  A missing file means defaults.
    #[arg(long, env = "WS_CONFIG")]
    config: Option<PathBuf>,

    /// Text sent back for every text message received.
    #[arg(long)]
    greeting: Option<String>,
}

impl Cli {
    /// Merges the configuration file (if any) with the CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or parsed.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(greeting) = self.greeting {
            config.greeting = greeting;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_server_config()?;

    // `RUST_LOG` wins; otherwise use the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let server = Server::new(config.clone());

    let greeting = config.greeting.clone();
    server.on(EventKind::Text, move |conn, payload| {
        debug!(
            "connection {}: received text {:?}",
            conn.id(),
            String::from_utf8_lossy(payload)
        );
        conn.send_text(&greeting)
            .with_context(|| format!("greeting connection {}", conn.id()))?;
        Ok(())
    });
    server.on(EventKind::ClientConnect, |conn, _| {
        info!(
            "client connected: {} from {} (path {})",
            conn.id(),
            conn.peer_addr().map_or_else(|| "unknown".to_string(), |a| a.to_string()),
            conn.path().unwrap_or("/")
        );
        Ok(())
    });
    server.on(EventKind::ClientDisconnect, |conn, _| {
        info!("client disconnected: {}", conn.id());
        Ok(())
    });

    let addr = server.run().await.context("starting WebSocket server")?;
    info!("ws-server ready on ws://{addr}/");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C signal")?;
    info!("received Ctrl+C; shutting down");

    server.stop().await;
    info!("ws-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
