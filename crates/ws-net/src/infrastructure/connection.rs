//! The connection engine: one WebSocket connection, either role.
//!
//! # Tasks per connection (for beginners)
//!
//! ```text
//!              ┌──────────────────────────┐
//!  socket ───► │ receive loop  (run)      │ ── messages ──► Dispatcher ──► handlers
//!  read half   │  read_frame              │
//!              │  FragmentState::accept   │ ── Pong / Close replies ─┐
//!              └──────────────────────────┘                          │
//!                                                                    ▼
//!  any task ─── send_frame ── encoded bytes ──► mpsc channel ──► write pump ──► socket
//!                                                                               write half
//! ```
//!
//! The receive loop owns the read half exclusively.  The write half belongs
//! to a single writer task; everybody else (handlers, other tasks, the
//! receive loop itself) hands it fully encoded frames through a channel.
//! Frames from concurrent senders can therefore never interleave on the
//! wire, and `send_frame` never has to await.
//!
//! # Shutdown
//!
//! The loop ends on end of stream, an I/O error, a protocol violation, a
//! completed closing handshake, or [`Connection::stop`].  In every case the
//! writer task is told to flush what is queued and shut the write half down,
//! and the read half is dropped, so the socket is closed exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;
use ws_core::protocol::frame::{encode_frame, DEFAULT_MAX_PAYLOAD_LEN, MAX_CONTROL_PAYLOAD};
use ws_core::{
    ConnectionId, EventKind, FragmentState, Frame, FrameError, HandshakeRequest, Message, Opcode,
    Role,
};

use crate::application::Dispatcher;
use crate::infrastructure::frame_io::{read_frame, BoxedRead, BoxedWrite, FrameSource, ReadError};

/// Handler table type used by connections.
pub type ConnectionHandlers = Dispatcher<Connection>;

/// Errors returned by [`Connection`] operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The writer task has exited; nothing more can be sent.
    #[error("connection is closed")]
    Closed,

    /// The frame would break a protocol rule (e.g. oversized control frame).
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// The receive loop was already started, or the connection was stopped
    /// before it started.
    #[error("receive loop already started or connection stopped")]
    ReaderTaken,
}

/// Construction parameters for [`Connection::new`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub role: Role,
    pub max_payload_len: usize,
    pub peer_addr: Option<SocketAddr>,
    /// The validated upgrade request (server side only).
    pub request: Option<HandshakeRequest>,
    /// Cancelling this token stops the connection.  The server passes a
    /// child of its own token so that stopping the server stops every
    /// connection.
    pub cancel: CancellationToken,
}

impl ConnectionSettings {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            peer_addr: None,
            request: None,
            cancel: CancellationToken::new(),
        }
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Shutdown,
}

/// Cheap, cloneable handle to one WebSocket connection.
///
/// Clones share the same socket, flags and handler table.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    role: Role,
    peer_addr: Option<SocketAddr>,
    request: Option<HandshakeRequest>,
    max_payload_len: usize,
    outbound: UnboundedSender<Outbound>,
    /// Set once this side has sent (or answered with) a Close frame.
    closing: AtomicBool,
    serving: AtomicBool,
    cancel: CancellationToken,
    /// Cancelled when the connection has fully shut down.
    finished: CancellationToken,
    reader: Mutex<Option<FrameSource>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<ConnectionHandlers>,
}

impl Connection {
    /// Wraps an already split, already upgraded stream.  Spawns the writer
    /// task immediately; the receive loop starts with [`run`](Self::run) or
    /// [`serve`](Self::serve).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        reader: FrameSource,
        writer: BoxedWrite,
        settings: ConnectionSettings,
        handlers: Arc<ConnectionHandlers>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_pump(writer, rx, settings.cancel.clone(), id));

        Self {
            inner: Arc::new(Inner {
                id,
                role: settings.role,
                peer_addr: settings.peer_addr,
                request: settings.request,
                max_payload_len: settings.max_payload_len,
                outbound: tx,
                closing: AtomicBool::new(false),
                serving: AtomicBool::new(false),
                cancel: settings.cancel,
                finished: CancellationToken::new(),
                reader: Mutex::new(Some(reader)),
                writer_task: Mutex::new(Some(writer_task)),
                handlers,
            }),
        }
    }

    /// Splits `stream` and wraps it.  Use [`new`](Self::new) instead when
    /// handshake bytes were already read through a buffered reader.
    pub fn from_stream<S>(stream: S, settings: ConnectionSettings, handlers: Arc<ConnectionHandlers>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let reader: BoxedRead = Box::new(read);
        Self::new(BufReader::new(reader), Box::new(write), settings, handlers)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Request path from the handshake (server side).
    pub fn path(&self) -> Option<&str> {
        self.inner.request.as_ref().map(|r| r.path.as_str())
    }

    /// `Host` header from the handshake (server side).
    pub fn host(&self) -> Option<&str> {
        self.inner.request.as_ref().map(|r| r.host.as_str())
    }

    /// `Origin` header from the handshake, if the client sent one.
    pub fn origin(&self) -> Option<&str> {
        self.inner.request.as_ref().and_then(|r| r.origin.as_deref())
    }

    /// `true` while the receive loop is running.
    pub fn is_serving(&self) -> bool {
        self.inner.serving.load(Ordering::SeqCst)
    }

    /// `true` once this side has sent a Close frame.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Registers a handler for a per-connection event.
    ///
    /// On a server-side connection the handler table is shared with every
    /// connection the server accepts.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Connection, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.handlers.on(kind, handler);
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Encodes one frame and queues it for the writer task.
    ///
    /// - `first == false` sends the frame as a continuation (opcode 0).
    /// - `last` sets FIN.  Control frames always get FIN and ignore `first`,
    ///   since they can never be fragmented.
    /// - Client-role connections mask every frame with a fresh random key.
    /// - The first Close marks the connection as closing.  Any later Close,
    ///   from any caller, is dropped and `Ok(())` is returned, so at most
    ///   one Close frame ever reaches the wire.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::InvalidFrame`] for a control payload over 125
    /// bytes, [`ConnectionError::Closed`] once the writer has exited.
    pub fn send_frame(&self, opcode: Opcode, payload: &[u8], first: bool, last: bool) -> Result<(), ConnectionError> {
        let control = opcode.is_control();
        if control && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge(payload.len() as u64).into());
        }

        // Claim the single Close before building anything.  `swap` makes the
        // check and the claim one step, so racing callers (a user `close()`
        // and the automatic reply to the peer's Close) cannot both win.
        if opcode == Opcode::Close && self.inner.closing.swap(true, Ordering::AcqRel) {
            debug!("connection {}: Close already sent; dropping another", self.inner.id);
            return Ok(());
        }

        // Continuations reuse the message's opcode slot; control frames are
        // never fragmented, so they always keep their own opcode and FIN.
        let wire_opcode = if first || control { opcode } else { Opcode::Continuation };
        let mut frame = Frame::new(wire_opcode, last || control, payload);
        if self.inner.role.masks_outgoing() {
            frame = frame.with_random_mask();
        }

        debug!(
            "connection {}: sending {:?} frame ({} B, fin={})",
            self.inner.id,
            wire_opcode,
            payload.len(),
            frame.fin
        );
        self.inner
            .outbound
            .send(Outbound::Frame(encode_frame(&frame)))
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.send_frame(Opcode::Text, text.as_bytes(), true, true)
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.send_frame(Opcode::Binary, data, true, true)
    }

    pub fn ping(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send_frame(Opcode::Ping, payload, true, true)
    }

    /// Starts the closing handshake.  Does nothing if this side already sent
    /// a Close frame.  The loop ends when the peer's Close reply arrives.
    pub fn close(&self) -> Result<(), ConnectionError> {
        // `send_frame` drops the frame if a Close already went out.
        self.send_frame(Opcode::Close, &[], true, true)
    }

    // ── Receive loop ─────────────────────────────────────────────────────────

    /// Runs the receive loop on the current task until the connection ends.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ReaderTaken`] if the loop was already started or
    /// the connection was stopped first.  Protocol violations and transport
    /// errors end the loop with `Ok(())`; they are logged, not returned.
    pub async fn run(&self) -> Result<(), ConnectionError> {
        // Taking the reader out of its slot is what makes the loop
        // single-entry: a second `run`, or a `stop` that got here first,
        // finds the slot empty.
        let mut reader = lock(&self.inner.reader)
            .take()
            .ok_or(ConnectionError::ReaderTaken)?;
        self.inner.serving.store(true, Ordering::SeqCst);

        let id = self.inner.id;
        let role = self.inner.role;
        let max = self.inner.max_payload_len;
        // Lives across iterations: a fragmented message spans several frames.
        let mut fragments = FragmentState::default();

        loop {
            let read = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    debug!("connection {id}: stop requested");
                    break;
                }
                read = read_frame(&mut reader, role, max) => read,
            };

            let frame = match read {
                Ok(frame) => frame,
                Err(ReadError::Closed) => {
                    if fragments.is_in_progress() {
                        debug!("connection {id}: peer closed the stream mid-message; dropping the partial message");
                    } else {
                        debug!("connection {id}: peer closed the stream");
                    }
                    break;
                }
                Err(ReadError::Io(e)) => {
                    debug!("connection {id}: read error: {e}");
                    break;
                }
                Err(ReadError::Protocol(e)) => {
                    error!("connection {id}: protocol violation: {e}");
                    break;
                }
            };
            debug!(
                "connection {id}: received {:?} frame ({} B, fin={})",
                frame.opcode,
                frame.payload.len(),
                frame.fin
            );

            // Continuations are buffered here; only complete messages and
            // control frames come out.
            let message = match fragments.accept(frame, max) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!("connection {id}: protocol violation: {e}");
                    break;
                }
            };

            if !self.dispatch(message) {
                break;
            }
        }

        // Drop the read half before the writer shuts down the write half,
        // so both directions of the socket are closed by the time
        // `closed()` resolves.
        drop(reader);
        self.finish().await;
        Ok(())
    }

    /// Spawns [`run`](Self::run) on a new task, leaving the caller free to
    /// send.  Used on the client side.
    pub fn serve(&self) -> JoinHandle<Result<(), ConnectionError>> {
        let conn = self.clone();
        tokio::spawn(async move { conn.run().await })
    }

    /// Stops the connection without a closing handshake.
    ///
    /// A running loop ends at its next suspension point.  A connection whose
    /// loop never started is shut down right away.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        let unstarted = lock(&self.inner.reader).take();
        if unstarted.is_some() {
            drop(unstarted);
            self.inner.finished.cancel();
        }
    }

    /// Resolves once the connection has fully shut down.
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }

    /// Emits `message` to the handlers, then applies the default control
    /// behaviour.  Returns `false` when the loop must end.
    fn dispatch(&self, message: Message) -> bool {
        let Message { kind, payload } = message;
        self.inner.handlers.emit(kind, self, &payload);

        match kind {
            EventKind::Ping => {
                if let Err(e) = self.send_frame(Opcode::Pong, &payload, true, true) {
                    debug!("connection {}: could not answer ping: {e}", self.inner.id);
                }
                true
            }
            EventKind::Close => {
                // Answer the peer's Close unless we started the closing
                // handshake ourselves; `send_frame` settles that atomically.
                if let Err(e) = self.send_frame(Opcode::Close, &[], true, true) {
                    debug!("connection {}: could not answer close: {e}", self.inner.id);
                }
                false
            }
            _ => true,
        }
    }

    async fn finish(&self) {
        self.inner.serving.store(false, Ordering::SeqCst);
        // `Shutdown` queues behind any frames already sent, so a Close reply
        // still reaches the peer.  An Err only means the writer already exited.
        let _ = self.inner.outbound.send(Outbound::Shutdown);
        let writer_task = lock(&self.inner.writer_task).take();
        if let Some(task) = writer_task {
            if let Err(e) = task.await {
                error!("connection {}: writer task failed: {e}", self.inner.id);
            }
        }
        info!("connection {} closed", self.inner.id);
        self.inner.finished.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("serving", &self.is_serving())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Drains the outbound channel into the write half until told to stop.
///
/// Ends on `Outbound::Shutdown`, on a write error, when every sender is gone,
/// or when the connection's token is cancelled (`stop` skips the queue).
/// The write half is shut down on the way out, which sends TCP FIN.
async fn write_pump(
    mut writer: BoxedWrite,
    mut rx: UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    id: ConnectionId,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        match next {
            Some(Outbound::Frame(bytes)) => {
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    debug!("connection {id}: write failed: {e}");
                    break;
                }
            }
            Some(Outbound::Shutdown) | None => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("connection {id}: shutdown failed: {e}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
