//! Binary codec for encoding and decoding RFC 6455 frames.
//!
//! Wire format:
//! ```text
//! byte0: [FIN:1][RSV1-3:3][OPCODE:4]
//! byte1: [MASK:1][PAYLOAD_LEN:7]
//!   len == 126 -> next 2 bytes = u16 BE extended length
//!   len == 127 -> next 8 bytes = u64 BE extended length (two u32 BE halves)
//!   if MASK    -> next 4 bytes = masking key
//! payload: length bytes, XORed with mask_key[i % 4] if masked
//! ```
//! Header size is 2 to 14 bytes. All multi-byte integers are big-endian.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::domain::event::EventKind;

// ── Wire constants ────────────────────────────────────────────────────────────

/// Size of the fixed part of every frame header (flags/opcode + mask/length).
pub const BASE_HEADER_LEN: usize = 2;

/// Largest possible header: 2 fixed + 8 extended length + 4 masking key.
pub const MAX_HEADER_LEN: usize = 14;

/// Control frames (Close, Ping, Pong) never carry more than this many bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default upper bound for a single frame or a reassembled message (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Payloads are read from a stream in chunks of at most this many bytes.
pub const READ_CHUNK_SIZE: usize = 1024;

const FIN_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Errors that can occur while decoding or validating frames.
///
/// Every variant except [`FrameError::InsufficientData`] is a protocol
/// violation: the connection that produced it must be closed without
/// dispatching the offending frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The byte slice is shorter than the frame it starts.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The opcode nibble is not one of 0, 1, 2, 8, 9, 10.
    #[error("unknown opcode: {0}")]
    InvalidOpcode(u8),

    /// The 64-bit extended length has its most significant bit set.
    #[error("extended payload length {0} exceeds 63 bits")]
    LengthOverflow(u64),

    /// The declared (or reassembled) payload is larger than the configured limit.
    #[error("payload of {len} B exceeds the {max} B limit")]
    PayloadTooLarge { len: u64, max: usize },

    /// A Close, Ping, or Pong frame declared more than 125 payload bytes.
    #[error("control frame payload of {0} B exceeds 125 B")]
    ControlFrameTooLarge(u64),

    /// A Close, Ping, or Pong frame arrived without the FIN bit.
    #[error("control frame ({0:?}) cannot be fragmented")]
    FragmentedControlFrame(Opcode),

    /// A continuation frame arrived while no fragmented message was open.
    #[error("received invalid continuation frame")]
    UnexpectedContinuation,

    /// A new Text/Binary frame arrived while a fragmented message was open.
    #[error("received invalid opcode ({0:?}) during fragmented transfer")]
    InterleavedDataFrame(Opcode),

    /// A server received a frame without the MASK bit.
    #[error("detected unmasked frame as server")]
    UnmaskedFrame,

    /// A client received a frame with the MASK bit.
    #[error("detected masked frame as client")]
    UnexpectedMask,
}

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// The 4-bit frame type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, Ping and Pong are control frames; they may interleave with a
    /// fragmented message but are never fragmented themselves.
    pub fn is_control(self) -> bool {
        (self as u8) >= 0x8
    }

    /// The event a complete message of this opcode is dispatched under.
    ///
    /// `Continuation` has no event of its own: its payload belongs to the
    /// message opened by an earlier Text or Binary frame.
    pub fn event_kind(self) -> Option<EventKind> {
        match self {
            Opcode::Continuation => None,
            Opcode::Text => Some(EventKind::Text),
            Opcode::Binary => Some(EventKind::Binary),
            Opcode::Close => Some(EventKind::Close),
            Opcode::Ping => Some(EventKind::Ping),
            Opcode::Pong => Some(EventKind::Pong),
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded or to-be-encoded frame.
///
/// The frame is masked exactly when `mask_key` is `Some`.  `payload` always
/// holds the *unmasked* application bytes: [`encode_frame`] applies the mask
/// on the way out and [`decode_frame`] removes it on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates an unmasked frame.
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Text, true, payload)
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, true, payload)
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, true, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, true, payload)
    }

    pub fn close() -> Self {
        Self::new(Opcode::Close, true, Vec::new())
    }

    /// Returns `true` when the MASK bit will be (or was) set on the wire.
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Sets an explicit masking key.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    /// Masks the frame with a fresh key from the operating system CSPRNG.
    ///
    /// Every client-to-server frame needs its own unpredictable key; a
    /// reused or guessable key lets a hostile page poison proxy caches.
    pub fn with_random_mask(self) -> Self {
        let mut key = [0u8; 4];
        OsRng.fill_bytes(&mut key);
        self.with_mask(key)
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The parsed header of a frame, before its payload has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Parses a frame header from the beginning of `bytes`.
    ///
    /// Returns the header and its length in bytes (2 to 14).  When `bytes`
    /// holds only part of the header, returns
    /// [`FrameError::InsufficientData`] with `needed` set to the full header
    /// length, so a stream reader can fetch exactly the missing bytes.
    ///
    /// The reserved bits RSV1-3 are not inspected: no extension is ever
    /// negotiated, so they carry no meaning here.
    ///
    /// # Errors
    ///
    /// [`FrameError::InvalidOpcode`] as soon as the first byte is available,
    /// and [`FrameError::LengthOverflow`] for a 64-bit length with its top
    /// bit set.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < BASE_HEADER_LEN {
            return Err(FrameError::InsufficientData {
                needed: BASE_HEADER_LEN,
                available: bytes.len(),
            });
        }

        let fin = bytes[0] & FIN_BIT != 0;
        let opcode = Opcode::try_from(bytes[0] & OPCODE_MASK)?;
        let masked = bytes[1] & MASK_BIT != 0;
        let base_len = bytes[1] & LENGTH_MASK;

        let extended_len = match base_len {
            LENGTH_16 => 2,
            LENGTH_64 => 8,
            _ => 0,
        };
        let header_len = BASE_HEADER_LEN + extended_len + if masked { 4 } else { 0 };
        if bytes.len() < header_len {
            return Err(FrameError::InsufficientData {
                needed: header_len,
                available: bytes.len(),
            });
        }

        let payload_len = match base_len {
            LENGTH_16 => u64::from(u16::from_be_bytes([bytes[2], bytes[3]])),
            LENGTH_64 => {
                let high = u64::from(read_u32(bytes, 2));
                let low = u64::from(read_u32(bytes, 6));
                // Parenthesised on purpose: `high << 32 + low` would shift by (32 + low).
                let len = (high << 32) | low;
                if len >> 63 != 0 {
                    return Err(FrameError::LengthOverflow(len));
                }
                len
            }
            short => u64::from(short),
        };

        let mask_key = if masked {
            let at = BASE_HEADER_LEN + extended_len;
            Some([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        } else {
            None
        };

        Ok((
            Self {
                fin,
                opcode,
                mask_key,
                payload_len,
            },
            header_len,
        ))
    }

    /// Checks the declared payload length against the control-frame limit
    /// and `max_payload_len`, returning it as a `usize` on success.
    ///
    /// Called before any payload byte is read, so an oversized declaration
    /// never causes an allocation.
    ///
    /// # Errors
    ///
    /// [`FrameError::ControlFrameTooLarge`] or [`FrameError::PayloadTooLarge`].
    pub fn check_limits(&self, max_payload_len: usize) -> Result<usize, FrameError> {
        if self.opcode.is_control() && self.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge(self.payload_len));
        }
        if self.payload_len > max_payload_len as u64 {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload_len,
                max: max_payload_len,
            });
        }
        Ok(self.payload_len as usize)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its wire bytes.
///
/// The length field uses the shortest form: one byte below 126, the 16-bit
/// form up to 65535, the 64-bit form above.  When the frame carries a
/// masking key, the key is written after the length and the payload is
/// XORed with it.
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::frame::{decode_frame, encode_frame, Frame, DEFAULT_MAX_PAYLOAD_LEN};
///
/// let frame = Frame::text("Hello");
/// let bytes = encode_frame(&frame);
/// assert_eq!(bytes, b"\x81\x05Hello");
/// let (decoded, consumed) = decode_frame(&bytes, DEFAULT_MAX_PAYLOAD_LEN).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let len = frame.payload.len();
    let mut buf = Vec::with_capacity(MAX_HEADER_LEN + len);

    buf.push(if frame.fin { FIN_BIT } else { 0 } | frame.opcode as u8);

    let mask_bit = if frame.is_masked() { MASK_BIT } else { 0 };
    if len < usize::from(LENGTH_16) {
        buf.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(mask_bit | LENGTH_16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        let len = len as u64;
        buf.push(mask_bit | LENGTH_64);
        buf.extend_from_slice(&((len >> 32) as u32).to_be_bytes());
        buf.extend_from_slice(&((len & 0xFFFF_FFFF) as u32).to_be_bytes());
    }

    match frame.mask_key {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(&frame.payload);
            apply_mask(&mut buf[start..], key, 0);
        }
        None => buf.extend_from_slice(&frame.payload),
    }
    buf
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the frame (payload already unmasked) and the total number of
/// bytes consumed, so the caller can advance their read cursor.
///
/// # Errors
///
/// [`FrameError::InsufficientData`] when `bytes` ends before the frame does;
/// any other variant means the bytes can never form a legal frame.
pub fn decode_frame(bytes: &[u8], max_payload_len: usize) -> Result<(Frame, usize), FrameError> {
    let (header, header_len) = FrameHeader::parse(bytes)?;
    let payload_len = header.check_limits(max_payload_len)?;

    let total = header_len + payload_len;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let mut payload = bytes[header_len..total].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key, 0);
    }

    Ok((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            mask_key: header.mask_key,
            payload,
        },
        total,
    ))
}

/// XORs `buf` in place with `key`, treating `buf[0]` as payload byte `offset`.
///
/// The offset lets a reader unmask a payload chunk by chunk.  Masking is its
/// own inverse: applying the same key twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[(offset + i) & 3];
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
