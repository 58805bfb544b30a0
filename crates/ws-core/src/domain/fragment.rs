//! Per-connection fragmentation state machine.
//!
//! # Why fragmentation needs state (for beginners)
//!
//! A large message may be split across several frames: the first carries
//! the real opcode (Text or Binary) with FIN clear, the following ones carry
//! opcode `Continuation`, and the last has FIN set.  Control frames (Ping,
//! Pong, Close) may appear *between* those fragments, but a second data
//! message may not start until the first one is finished.
//!
//! ```text
//! Text(fin=0) ── Ping ── Cont(fin=0) ── Cont(fin=1)
//!   open          ok       append         emit "text"
//! ```
//!
//! [`FragmentState`] tracks which of the two situations we are in and turns
//! a stream of frames into a stream of complete [`Message`]s.

use std::mem;

use crate::domain::event::EventKind;
use crate::protocol::frame::{Frame, FrameError, Opcode};

/// A complete message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

/// Whether a fragmented data message is currently open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FragmentState {
    #[default]
    None,
    InProgress { opcode: Opcode, buffer: Vec<u8> },
}

impl FragmentState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, FragmentState::InProgress { .. })
    }

    /// Feeds one decoded frame through the state machine.
    ///
    /// Returns `Ok(Some(message))` when the frame completes a message (or is
    /// a control frame), `Ok(None)` when it only extends an open message.
    ///
    /// On `Err` the connection must be closed; the state is left as it was
    /// before the call.
    ///
    /// # Errors
    ///
    /// - [`FrameError::FragmentedControlFrame`] for a control frame without FIN.
    /// - [`FrameError::UnexpectedContinuation`] for a continuation with no open message.
    /// - [`FrameError::InterleavedDataFrame`] for a new Text/Binary while a message is open.
    /// - [`FrameError::PayloadTooLarge`] when the reassembled message would
    ///   exceed `max_payload_len`.
    pub fn accept(
        &mut self,
        frame: Frame,
        max_payload_len: usize,
    ) -> Result<Option<Message>, FrameError> {
        let Frame {
            fin,
            opcode,
            payload,
            ..
        } = frame;

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame(opcode));
            }
            return Ok(opcode.event_kind().map(|kind| Message { kind, payload }));
        }

        match mem::take(self) {
            FragmentState::None => match opcode {
                Opcode::Continuation => Err(FrameError::UnexpectedContinuation),
                _ if fin => Ok(opcode.event_kind().map(|kind| Message { kind, payload })),
                _ => {
                    *self = FragmentState::InProgress {
                        opcode,
                        buffer: payload,
                    };
                    Ok(None)
                }
            },
            FragmentState::InProgress {
                opcode: open,
                mut buffer,
            } => {
                if opcode != Opcode::Continuation {
                    *self = FragmentState::InProgress { opcode: open, buffer };
                    return Err(FrameError::InterleavedDataFrame(opcode));
                }
                let total = buffer.len() + payload.len();
                if total > max_payload_len {
                    *self = FragmentState::InProgress { opcode: open, buffer };
                    return Err(FrameError::PayloadTooLarge {
                        len: total as u64,
                        max: max_payload_len,
                    });
                }
                buffer.extend_from_slice(&payload);
                if fin {
                    Ok(open.event_kind().map(|kind| Message {
                        kind,
                        payload: buffer,
                    }))
                } else {
                    *self = FragmentState::InProgress { opcode: open, buffer };
                    Ok(None)
                }
            }
        }
    }
}
