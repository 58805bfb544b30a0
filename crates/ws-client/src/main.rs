//! ws-client: send one text message to a WebSocket server and print what
//! comes back.
//!
//! # Usage
//!
//! ```text
//! ws-client [OPTIONS]
//!
//! Options:
//!   --host <HOST>          Server host [default: 127.0.0.1]
//!   --port <PORT>          Server port [default: 4568]
//!   --path <PATH>          Request path [default: /]
//!   --origin <ORIGIN>      Origin header to send
//!   --header <NAME:VALUE>  Extra request header (repeatable)
//!   --message <TEXT>       Text message to send [default: Hello?]
//!   --ping                 Send a ping before the message
//!   --print <KINDS>        Events to print, comma-separated
//!                          [default: text,binary,pong,close]
//!   --wait-ms <MS>         How long to wait for a reply [default: 2000]
//! ```
//!
//! Against the bundled `ws-server`:
//!
//! ```text
//! $ ws-client --message "Hello?"
//! > text: Hello?
//! < text: Hello!
//! < close
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use ws_net::{connect, ClientOptions, EventKind};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "ws-client", about = "Send a message to a WebSocket server", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1", env = "WS_HOST")]
    host: String,

    #[arg(long, default_value_t = 4568, env = "WS_PORT")]
    port: u16,

    #[arg(long, default_value = "/")]
    path: String,

    /// Origin header.  Omitted when not given.
    #[arg(long)]
    origin: Option<String>,

    /// Extra request header in `Name: Value` form.  May be repeated.
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    #[arg(long, default_value = "Hello?")]
    message: String,

    /// Send a ping (payload `ws-client`) before the message.
    #[arg(long)]
    ping: bool,

    /// Milliseconds to wait for a reply, and again for the closing handshake.
    #[arg(long, default_value_t = 2000)]
    wait_ms: u64,

    /// Connection events to print, by name (`text`, `binary`, `ping`,
    /// `pong`, `close`).
    #[arg(
        long = "print",
        value_delimiter = ',',
        value_parser = parse_event_kind,
        default_values_t = [EventKind::Text, EventKind::Binary, EventKind::Pong, EventKind::Close]
    )]
    print: Vec<EventKind>,
}

impl Cli {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            path: self.path.clone(),
            origin: self.origin.clone(),
            headers: self.headers.clone(),
            ..ClientOptions::default()
        }
    }

    fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Splits `Name: Value` (or `Name:Value`) into its trimmed parts.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parses a per-connection event name.  `client_connect` and
/// `client_disconnect` are rejected: only a server emits them.
fn parse_event_kind(raw: &str) -> Result<EventKind, String> {
    let kind = raw.trim().parse::<EventKind>().map_err(|e| e.to_string())?;
    if kind.is_server_level() {
        return Err(format!("{kind} is a server-level event; a client never receives it"));
    }
    Ok(kind)
}

/// One output line for a received event.
fn describe(kind: EventKind, payload: &[u8]) -> String {
    match kind {
        EventKind::Binary => format!("< binary: {} bytes", payload.len()),
        _ if payload.is_empty() => format!("< {kind}"),
        _ => format!("< {kind}: {}", String::from_utf8_lossy(payload)),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let conn = connect(&cli.host, cli.port, cli.client_options())
        .await
        .with_context(|| format!("connecting to ws://{}:{}{}", cli.host, cli.port, cli.path))?;

    // Printers first so a reply is printed before the wait below ends.
    for kind in cli.print.iter().copied() {
        conn.on(kind, move |_, payload| {
            println!("{}", describe(kind, payload));
            Ok(())
        });
    }
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    conn.on(EventKind::Text, move |_, _| {
        let _ = reply_tx.send(());
        Ok(())
    });
    let receive_loop = conn.serve();

    if cli.ping {
        conn.ping(b"ws-client").context("sending ping")?;
        println!("> ping: ws-client");
    }
    conn.send_text(&cli.message).context("sending message")?;
    println!("> text: {}", cli.message);

    tokio::select! {
        _ = replies.recv() => {}
        _ = conn.closed() => warn!("server closed the connection before replying"),
        _ = tokio::time::sleep(cli.wait()) => warn!("no reply within {} ms", cli.wait_ms),
    }

    if let Err(e) = conn.close() {
        debug!("could not send close: {e}");
    }
    if tokio::time::timeout(cli.wait(), conn.closed()).await.is_err() {
        warn!("server did not finish the closing handshake; dropping the connection");
        conn.stop();
        conn.closed().await;
    }

    receive_loop
        .await
        .context("receive loop panicked")?
        .context("receive loop failed")?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
