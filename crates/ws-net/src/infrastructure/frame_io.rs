//! Reading frames and handshake heads from async byte streams.
//!
//! [`ws_core`] parses byte slices; this module supplies those slices from a
//! socket.  A frame is read in three steps:
//!
//! 1. the two fixed header bytes,
//! 2. whatever extended-length and masking-key bytes the header announces
//!    (the header parser reports exactly how many via `InsufficientData`),
//! 3. the payload, in chunks of at most 1024 bytes, unmasked as it arrives.
//!
//! Limits are checked between steps 2 and 3, so a peer declaring a huge
//! payload is rejected before any memory is reserved for it.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use ws_core::protocol::frame::{
    apply_mask, encode_frame, Frame, FrameError, FrameHeader, BASE_HEADER_LEN, MAX_HEADER_LEN,
    READ_CHUNK_SIZE,
};
use ws_core::protocol::handshake::{HandshakeError, MAX_HANDSHAKE_LEN};
use ws_core::Role;

/// Type-erased read half, so TCP sockets and in-memory pipes share one
/// connection type.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The buffered reader a connection's receive loop consumes.  The same
/// buffer is used for the handshake head and the frames after it, so bytes
/// the peer sent early are never lost.
pub type FrameSource = BufReader<BoxedRead>;

/// Why [`read_frame`] stopped.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The peer closed the stream (cleanly or mid-frame).
    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The bytes can never form a legal frame for this connection.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
}

/// Why [`read_handshake_head`] stopped.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("connection closed before the handshake completed")]
    Closed,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Reads one frame from `reader`.
///
/// The returned payload is already unmasked.  Fragmentation rules are not
/// checked here; feed the frame to [`ws_core::FragmentState::accept`].
///
/// # Errors
///
/// - [`ReadError::Closed`] on end of stream.
/// - [`ReadError::Protocol`] for an invalid opcode, a masking-direction
///   mismatch for `role`, or a payload over `max_payload_len`.
pub async fn read_frame<R>(reader: &mut R, role: Role, max_payload_len: usize) -> Result<Frame, ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; MAX_HEADER_LEN];
    let mut filled = 0;
    let mut wanted = BASE_HEADER_LEN;

    let header = loop {
        fill(reader, &mut head[filled..wanted]).await?;
        filled = wanted;
        match FrameHeader::parse(&head[..filled]) {
            Ok((header, _)) => break header,
            Err(FrameError::InsufficientData { needed, .. }) => wanted = needed,
            Err(e) => return Err(e.into()),
        }
    };

    role.validate_incoming(header.mask_key.is_some())?;
    let len = header.check_limits(max_payload_len)?;

    let mut payload = Vec::with_capacity(len.min(READ_CHUNK_SIZE * 64));
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while payload.len() < len {
        let take = (len - payload.len()).min(READ_CHUNK_SIZE);
        let buf = &mut chunk[..take];
        fill(reader, buf).await?;
        if let Some(key) = header.mask_key {
            apply_mask(buf, key, payload.len());
        }
        payload.extend_from_slice(buf);
    }

    Ok(Frame {
        fin: header.fin,
        opcode: header.opcode,
        mask_key: header.mask_key,
        payload,
    })
}

/// Encodes `frame` and writes it in one `write_all`.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_frame(frame)).await?;
    writer.flush().await
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ReadError::Closed),
        Err(e) => Err(ReadError::Io(e)),
    }
}

// ── Handshake head ────────────────────────────────────────────────────────────

/// Reads an HTTP head line by line, up to and including the blank line that
/// ends it.  Bytes after the blank line stay in `reader`'s buffer.
///
/// # Errors
///
/// - [`HeadError::Closed`] if the stream ends before the blank line.
/// - [`HeadError::Handshake`] with [`HandshakeError::TooLarge`] once
///   [`MAX_HANDSHAKE_LEN`] bytes have been read without finding it.
pub async fn read_handshake_head<R>(reader: &mut R) -> Result<String, HeadError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut head = Vec::new();
    loop {
        let remaining = MAX_HANDSHAKE_LEN - head.len();
        if remaining == 0 {
            return Err(HandshakeError::TooLarge { max: MAX_HANDSHAKE_LEN }.into());
        }

        let start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            // Either the limit cut the line short or the stream ended mid-line.
            if head.len() >= MAX_HANDSHAKE_LEN {
                return Err(HandshakeError::TooLarge { max: MAX_HANDSHAKE_LEN }.into());
            }
            return Err(HeadError::Closed);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
