//! WebSocket server: accept loop, handshake, and per-session task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections.
//! 3. Reading and validating each upgrade request, answering `101` or `400`.
//! 4. Wrapping each upgraded socket in a [`Connection`] that shares the
//!    server's per-connection handler table.
//! 5. Tracking live connections in the registry and firing
//!    `client_connect` / `client_disconnect`.
//! 6. Stopping everything on [`Server::stop`].
//!
//! # Scalability
//!
//! Each session runs in its own Tokio task, tracked by a `TaskTracker` so
//! that `stop` can wait for all of them.  The accept loop never blocks on a
//! session: it accepts a connection and immediately spawns a task for it
//! before accepting the next one.
//!
//! # Failure isolation
//!
//! A failed handshake, an I/O error or a misbehaving peer only ends that
//! peer's task.  It is logged, its socket is closed, and the accept loop and
//! every other connection carry on.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use ws_core::protocol::handshake::bad_request_response;
use ws_core::{EventKind, HandshakeError, HandshakeRequest, Role};

use crate::application::{ConnectionRegistry, Dispatcher};
use crate::domain::config::ServerConfig;
use crate::infrastructure::connection::{
    Connection, ConnectionError, ConnectionHandlers, ConnectionSettings,
};
use crate::infrastructure::frame_io::{read_handshake_head, BoxedRead, BoxedWrite, HeadError};

/// Errors returned by [`Server::run`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,
}

/// A multi-connection WebSocket server.
///
/// Cheap to clone; clones control the same server.
///
/// # Example
///
/// ```rust,no_run
/// use ws_net::{EventKind, Server, ServerConfig};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let server = Server::new(ServerConfig::default());
/// server.on(EventKind::Text, |conn, _payload| {
///     conn.send_text("Hello!")?;
///     Ok(())
/// });
/// let addr = server.run().await?;
/// println!("listening on {addr}");
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    /// `client_connect` / `client_disconnect` handlers.
    server_handlers: Dispatcher<Connection>,
    /// Message-event handlers shared by every accepted connection.
    connection_handlers: Arc<ConnectionHandlers>,
    registry: ConnectionRegistry<Connection>,
    state: Mutex<Option<RunningState>>,
}

/// Exists only between `run` and `stop`.
struct RunningState {
    local_addr: SocketAddr,
    /// Parent of every session's token.
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    /// One task per accepted socket, from handshake to cleanup.
    sessions: TaskTracker,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                server_handlers: Dispatcher::new(),
                connection_handlers: Arc::new(ConnectionHandlers::new()),
                registry: ConnectionRegistry::new(),
                state: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registers a handler.
    ///
    /// `client_connect` and `client_disconnect` go to the server's own table
    /// and receive the affected connection with an empty payload.  Every
    /// other kind goes to the table shared by all connections this server
    /// accepts, including ones already connected.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Connection, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if kind.is_server_level() {
            self.inner.server_handlers.on(kind, handler);
        } else {
            self.inner.connection_handlers.on(kind, handler);
        }
    }

    /// Binds the listener and starts accepting connections in the
    /// background.  Returns the bound address (useful with port `0`).
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] if `run` was already called without a
    /// matching `stop`, [`ServerError::Bind`] if the address is unavailable.
    pub async fn run(&self) -> Result<SocketAddr, ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        // Bind before taking the state lock: binding awaits, and a std
        // `Mutex` guard must never be held across an `.await`.
        let config = &self.inner.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let mut state = lock(&self.inner.state);
        if state.is_some() {
            // Lost a race with a concurrent `run`; our listener is dropped here.
            return Err(ServerError::AlreadyRunning);
        }

        // One parent token for the whole server.  Every session gets a child
        // of it, so cancelling the parent reaches every connection at once.
        let cancel = CancellationToken::new();
        let sessions = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.inner),
            cancel.clone(),
            sessions.clone(),
        ));
        *state = Some(RunningState {
            local_addr,
            cancel,
            accept_task,
            sessions,
        });

        info!("WebSocket server listening on {local_addr}");
        Ok(local_addr)
    }

    /// Stops every tracked connection, then the accept loop, and closes the
    /// listener.  Returns once all session tasks have ended.
    ///
    /// Connections are cut without a closing handshake.  Calling `stop` on
    /// a server that is not running does nothing.
    pub async fn stop(&self) {
        let Some(state) = lock(&self.inner.state).take() else {
            return;
        };
        info!("stopping WebSocket server on {}", state.local_addr);

        // Cut live connections first so their loops stop reading, then the
        // accept loop.  Sessions still mid-handshake see the parent token.
        if self.inner.registry.is_empty() {
            debug!("no live connections to stop");
        } else {
            info!("stopping {} live connection(s)", self.inner.registry.len());
            self.inner.registry.for_each(Connection::stop);
        }
        state.cancel.cancel();

        // The accept loop exits on the cancelled token and drops the
        // listener, so the port is free once this returns.
        if let Err(e) = state.accept_task.await {
            error!("accept loop task failed: {e}");
        }
        // No new sessions can be spawned now; wait for the running ones.
        state.sessions.close();
        state.sessions.wait().await;

        info!("WebSocket server stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).is_some()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).as_ref().map(|s| s.local_addr)
    }

    /// Point-in-time copy of the live connections.
    pub fn connected_clients(&self) -> Vec<Connection> {
        self.inner.registry.snapshot()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Accepts TCP connections until `cancel` fires.
///
/// # How `tokio::select!` is used here (for beginners)
///
/// `select!` waits on several futures at once and runs the branch of
/// whichever finishes first, dropping the others.  Here the two futures are
/// "the server was stopped" and "a new client connected".  Dropping a
/// pending `accept()` is safe: no connection is lost, it simply stays in the
/// kernel's backlog until the listener itself is dropped.
///
/// Each accepted socket gets its own task, tracked by `sessions` so that
/// [`Server::stop`] can wait for all of them.
async fn accept_loop(
    listener: TcpListener,
    server: Arc<ServerInner>,
    cancel: CancellationToken,
    sessions: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("accepted TCP connection from {peer_addr}");
                let server = Arc::clone(&server);
                let cancel = cancel.child_token();
                sessions.spawn(async move {
                    handle_session(server, stream, peer_addr, cancel).await;
                });
            }
            Err(e) => {
                // Transient (e.g. too many open files); keep accepting.
                error!("accept error: {e}");
            }
        }
    }
    debug!("accept loop stopped");
}

// ── Per-session handler ───────────────────────────────────────────────────────

/// Wraps [`run_session`] and logs the outcome.
async fn handle_session(
    server: Arc<ServerInner>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) {
    match run_session(server, stream, peer_addr, cancel).await {
        Ok(()) => debug!("session {peer_addr} ended"),
        Err(e) => warn!("session {peer_addr} ended with error: {e:#}"),
    }
}

/// Runs one session: handshake, registration, receive loop, cleanup.
async fn run_session(
    server: Arc<ServerInner>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("session {peer_addr}: could not set TCP_NODELAY: {e}");
    }
    // Owned halves so the read side can move into the receive loop while
    // the write side moves into the writer task.  The `BufReader` is kept
    // for the whole session: any frame bytes that arrived in the same
    // packet as the handshake are already in its buffer.
    let (read, write) = stream.into_split();
    let read: BoxedRead = Box::new(read);
    let mut reader = BufReader::new(read);
    let mut writer: BoxedWrite = Box::new(write);

    // ── Step 1: read the upgrade request ──────────────────────────────────────
    let config = &server.config;
    let head = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        head = timeout(config.handshake_timeout(), read_handshake_head(&mut reader)) => head,
    };
    let head = match head {
        Ok(Ok(head)) => head,
        Ok(Err(HeadError::Closed)) => {
            debug!("session {peer_addr}: closed before completing the handshake");
            return Ok(());
        }
        Ok(Err(HeadError::Handshake(e))) => {
            reject(&mut writer, peer_addr, &e).await;
            return Ok(());
        }
        Ok(Err(HeadError::Io(e))) => {
            return Err(e).with_context(|| format!("reading handshake from {peer_addr}"));
        }
        Err(_) => {
            warn!(
                "session {peer_addr}: no handshake within {}s; dropping",
                config.handshake_timeout_secs
            );
            return Ok(());
        }
    };

    // ── Step 2: validate and answer ───────────────────────────────────────────
    let request = match HandshakeRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            reject(&mut writer, peer_addr, &e).await;
            return Ok(());
        }
    };
    if !request.extra_headers.is_empty() {
        info!(
            "session {peer_addr}: Additional WebSocket headers: {}",
            request.extra_headers.join("#")
        );
    }
    writer
        .write_all(request.response().as_bytes())
        .await
        .with_context(|| format!("writing handshake response to {peer_addr}"))?;
    writer.flush().await?;

    // ── Step 3: serve ─────────────────────────────────────────────────────────
    let path = request.path.clone();
    let settings = ConnectionSettings {
        role: Role::Server,
        max_payload_len: config.max_payload_len,
        peer_addr: Some(peer_addr),
        request: Some(request),
        cancel,
    };
    let conn = Connection::new(reader, writer, settings, Arc::clone(&server.connection_handlers));
    info!("session {peer_addr}: connection {} established on {path}", conn.id());

    serve_connection(&server, conn).await
}

/// Registers `conn`, runs its receive loop to the end, then unregisters it.
///
/// `client_connect` fires after the connection is visible in
/// [`Server::connected_clients`]; `client_disconnect` fires after it has
/// been removed.  Both fire exactly once, even when the loop never runs.
async fn serve_connection(server: &ServerInner, conn: Connection) -> anyhow::Result<()> {
    let id = conn.id();
    server.registry.insert(id, conn.clone());
    server.server_handlers.emit(EventKind::ClientConnect, &conn, &[]);

    let outcome = match conn.run().await {
        // `Server::stop` reached this connection through the registry before
        // its loop took the reader.  That is a normal shutdown.
        Err(ConnectionError::ReaderTaken) => {
            debug!("connection {id}: stopped before its receive loop started");
            Ok(())
        }
        other => other,
    };

    server.registry.remove(&id);
    server.server_handlers.emit(EventKind::ClientDisconnect, &conn, &[]);
    outcome.with_context(|| format!("connection {id}"))
}

/// Answers a failed handshake with `400 Bad Request` and closes the write
/// half.
async fn reject(writer: &mut BoxedWrite, peer_addr: SocketAddr, err: &HandshakeError) {
    warn!("session {peer_addr}: handshake rejected: {err}");
    let response = bad_request_response(&err.to_string());
    let sent = async {
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await
    }
    .await;
    if let Err(e) = sent {
        debug!("session {peer_addr}: could not send 400 response: {e}");
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// The guarded state is a plain `Option`, so it cannot be left half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
