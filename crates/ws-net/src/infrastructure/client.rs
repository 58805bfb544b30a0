//! Client side: open a socket, perform the upgrade handshake, return a
//! [`Connection`] in the client role.
//!
//! The returned connection is not serving yet.  Register handlers with
//! [`Connection::on`] first, then call [`Connection::serve`]; frames the
//! server sent right after its `101` response are kept buffered until then.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use ws_core::{ClientHandshake, HandshakeError, Role};

use crate::domain::config::ClientOptions;
use crate::infrastructure::connection::{Connection, ConnectionHandlers, ConnectionSettings};
use crate::infrastructure::frame_io::{read_handshake_head, BoxedRead, BoxedWrite, HeadError};

/// Why [`connect`] failed.  In both cases the socket has been closed.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered, but not with a valid WebSocket upgrade.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The TCP connection could not be opened or broke mid-handshake.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Connects to `host:port` over TCP and performs the client handshake.
///
/// # Errors
///
/// [`ClientError::Transport`] if the socket cannot be opened or is closed
/// during the handshake; [`ClientError::Handshake`] if the response is not
/// an acceptable `101 Switching Protocols`.
pub async fn connect(host: &str, port: u16, options: ClientOptions) -> Result<Connection, ClientError> {
    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        error!("could not connect to {host}:{port}: {e}");
        ClientError::Transport(e)
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {e}");
    }
    let peer_addr = stream.peer_addr().ok();
    handshake(stream, host, port, &options, peer_addr).await
}

/// Performs the client handshake over an already open stream.
///
/// `host` and `port` only feed the `Host` header.
///
/// # Errors
///
/// Same as [`connect`].
pub async fn connect_with_stream<S>(
    stream: S,
    host: &str,
    port: u16,
    options: ClientOptions,
) -> Result<Connection, ClientError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    handshake(stream, host, port, &options, None).await
}

async fn handshake<S>(
    stream: S,
    host: &str,
    port: u16,
    options: &ClientOptions,
    peer_addr: Option<SocketAddr>,
) -> Result<Connection, ClientError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let read: BoxedRead = Box::new(read);
    let mut reader = BufReader::new(read);
    let mut writer: BoxedWrite = Box::new(write);

    let client_handshake = ClientHandshake::new(&options.request_options(host, port));
    let exchanged = async {
        writer.write_all(client_handshake.request().as_bytes()).await?;
        writer.flush().await?;
        let head = read_handshake_head(&mut reader).await.map_err(|e| match e {
            HeadError::Handshake(e) => ClientError::Handshake(e),
            HeadError::Io(e) => ClientError::Transport(e),
            HeadError::Closed => ClientError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection during the handshake",
            )),
        })?;
        client_handshake.verify_response(&head)?;
        Ok::<_, ClientError>(())
    }
    .await;

    if let Err(e) = exchanged {
        error!("handshake with {host}:{port} failed: {e}");
        info!("client shutting down");
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown after failed handshake: {e}");
        }
        return Err(e);
    }

    let settings = ConnectionSettings {
        role: Role::Client,
        max_payload_len: options.max_payload_len,
        peer_addr,
        request: None,
        cancel: CancellationToken::new(),
    };
    let conn = Connection::new(reader, writer, settings, Arc::new(ConnectionHandlers::new()));
    info!("connection {} established to {host}:{port}{}", conn.id(), options.path);
    Ok(conn)
}
