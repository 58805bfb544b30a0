//! Protocol module containing the binary frame codec and the HTTP handshake.

pub mod frame;
pub mod handshake;

pub use frame::{apply_mask, decode_frame, encode_frame, Frame, FrameError, FrameHeader, Opcode};
pub use handshake::{
    accept_key, bad_request_response, generate_key, switching_protocols_response,
    ClientHandshake, ClientRequestOptions, HandshakeError, HandshakeRequest,
};
