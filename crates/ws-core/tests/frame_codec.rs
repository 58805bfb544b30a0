//! Integration tests for the ws-core frame codec.
//!
//! These tests drive the public API with the worked examples from RFC 6455
//! §5.7 and with payloads sitting on every length-encoding boundary.

use ws_core::{
    accept_key, decode_frame, encode_frame,
    protocol::frame::{apply_mask, DEFAULT_MAX_PAYLOAD_LEN},
    FragmentState, Frame, FrameError, Opcode,
};

fn decode_all(bytes: &[u8]) -> Frame {
    let (frame, consumed) = decode_frame(bytes, DEFAULT_MAX_PAYLOAD_LEN).expect("decode must succeed");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    frame
}

// ── Length boundaries ─────────────────────────────────────────────────────────

#[test]
fn test_length_boundaries_select_expected_encoding() {
    // (payload length, expected header length, expected second byte)
    let cases = [
        (0usize, 2usize, 0u8),
        (125, 2, 125),
        (126, 4, 126),
        (65_535, 4, 126),
        (65_536, 10, 127),
    ];

    for (len, header_len, marker) in cases {
        let frame = Frame::binary(vec![0x5A; len]);
        let bytes = encode_frame(&frame);

        assert_eq!(bytes.len(), header_len + len, "total size for {len}");
        assert_eq!(bytes[1], marker, "length marker for {len}");
        assert_eq!(decode_all(&bytes), frame, "round trip for {len}");
    }
}

#[test]
fn test_masked_boundaries_round_trip() {
    for len in [0usize, 125, 126, 65_535, 65_536] {
        let frame = Frame::binary((0..len).map(|i| i as u8).collect::<Vec<_>>()).with_random_mask();
        let bytes = encode_frame(&frame);
        assert_eq!(bytes[1] & 0x80, 0x80, "mask bit for {len}");
        assert_eq!(decode_all(&bytes), frame);
    }
}

#[test]
fn test_16_bit_length_is_big_endian() {
    let bytes = encode_frame(&Frame::binary(vec![0; 256]));
    assert_eq!(&bytes[..4], &[0x82, 0x7E, 0x01, 0x00]);
}

#[test]
fn test_64_bit_length_is_big_endian() {
    let bytes = encode_frame(&Frame::binary(vec![0; 65_536]));
    assert_eq!(&bytes[..10], &[0x82, 0x7F, 0, 0, 0, 0, 0, 0x01, 0, 0]);
}

#[test]
fn test_declared_length_above_limit_is_rejected_before_payload() {
    // Header alone: 64-bit length of 1 GiB, no payload bytes follow.
    let header = [0x82, 0x7F, 0, 0, 0, 0, 0x40, 0, 0, 0];
    assert_eq!(
        decode_frame(&header, DEFAULT_MAX_PAYLOAD_LEN),
        Err(FrameError::PayloadTooLarge {
            len: 1 << 30,
            max: DEFAULT_MAX_PAYLOAD_LEN
        })
    );
}

// ── RFC 6455 §5.7 examples ────────────────────────────────────────────────────

#[test]
fn test_rfc_single_frame_unmasked_text() {
    let frame = decode_all(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    assert!(frame.fin);
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(!frame.is_masked());
    assert_eq!(frame.payload, b"Hello");
}

#[test]
fn test_rfc_single_frame_masked_text() {
    let frame = decode_all(&[
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ]);
    assert_eq!(frame.mask_key, Some([0x37, 0xfa, 0x21, 0x3d]));
    assert_eq!(frame.payload, b"Hello");
}

#[test]
fn test_rfc_fragmented_unmasked_text() {
    let mut bytes = vec![0x01, 0x03, 0x48, 0x65, 0x6c];
    bytes.extend_from_slice(&[0x80, 0x02, 0x6c, 0x6f]);

    let (first, consumed) = decode_frame(&bytes, DEFAULT_MAX_PAYLOAD_LEN).unwrap();
    let second = decode_all(&bytes[consumed..]);

    let mut state = FragmentState::default();
    assert_eq!(state.accept(first, DEFAULT_MAX_PAYLOAD_LEN), Ok(None));
    let message = state
        .accept(second, DEFAULT_MAX_PAYLOAD_LEN)
        .unwrap()
        .expect("second fragment completes the message");
    assert_eq!(message.payload, b"Hello");
}

#[test]
fn test_rfc_unmasked_ping_and_masked_pong() {
    let ping = decode_all(&[0x89, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    assert_eq!(ping.opcode, Opcode::Ping);
    assert_eq!(ping.payload, b"Hello");

    let pong = decode_all(&[
        0x8a, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ]);
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"Hello");
}

#[test]
fn test_rfc_handshake_accept_vector() {
    assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

// ── Masking ───────────────────────────────────────────────────────────────────

#[test]
fn test_masking_is_involutive_for_any_key() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    for key in [[0, 0, 0, 0], [0xFF; 4], [1, 2, 3, 4], [0x37, 0xFA, 0x21, 0x3D]] {
        let mut buf = payload.clone();
        apply_mask(&mut buf, key, 0);
        apply_mask(&mut buf, key, 0);
        assert_eq!(buf, payload, "key {key:?}");
    }
}

#[test]
fn test_invalid_opcodes_are_rejected() {
    for opcode in [0x3u8, 0x7, 0xB, 0xF] {
        let bytes = [0x80 | opcode, 0x00];
        assert_eq!(
            decode_frame(&bytes, DEFAULT_MAX_PAYLOAD_LEN),
            Err(FrameError::InvalidOpcode(opcode))
        );
    }
}
