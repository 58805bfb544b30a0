//! End-to-end tests over real TCP sockets on 127.0.0.1.
//!
//! Each test starts its own [`Server`] on port `0` so tests can run in
//! parallel.  Protocol-level checks use a raw socket plus the frame helpers
//! from `ws_net::infrastructure::frame_io`; the rest go through
//! [`ws_net::connect`].  The last section talks to `tokio-tungstenite` as an
//! independent RFC 6455 implementation.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use ws_core::protocol::handshake::ClientRequestOptions;
use ws_core::{encode_frame, ClientHandshake, Frame, Opcode, Role};
use ws_net::infrastructure::frame_io::{read_frame, read_handshake_head, write_frame, ReadError};
use ws_net::{connect, ClientOptions, EventKind, Server, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);
const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

// ── Helpers ───────────────────────────────────────────────────────────────────

/// What the test server observed, delivered through channels.
struct Observed {
    texts: mpsc::UnboundedReceiver<Vec<u8>>,
    connects: mpsc::UnboundedReceiver<Uuid>,
    disconnects: mpsc::UnboundedReceiver<Uuid>,
}

fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

/// Starts a server that greets text, echoes binary and reports events.
async fn start_server(config: ServerConfig) -> (Server, SocketAddr, Observed) {
    let server = Server::new(config);
    let (text_tx, texts) = mpsc::unbounded_channel();
    let (connect_tx, connects) = mpsc::unbounded_channel();
    let (disconnect_tx, disconnects) = mpsc::unbounded_channel();

    let greeting = server.config().greeting.clone();
    server.on(EventKind::Text, move |conn, payload| {
        let _ = text_tx.send(payload.to_vec());
        conn.send_text(&greeting)?;
        Ok(())
    });
    server.on(EventKind::Binary, |conn, payload| {
        conn.send_binary(payload)?;
        Ok(())
    });
    server.on(EventKind::ClientConnect, move |conn, _| {
        let _ = connect_tx.send(conn.id());
        Ok(())
    });
    server.on(EventKind::ClientDisconnect, move |conn, _| {
        let _ = disconnect_tx.send(conn.id());
        Ok(())
    });

    let addr = server.run().await.unwrap();
    (
        server,
        addr,
        Observed {
            texts,
            connects,
            disconnects,
        },
    )
}

/// Opens a socket and completes the handshake by hand.
async fn raw_upgrade(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let handshake = ClientHandshake::new(&ClientRequestOptions::new("127.0.0.1", addr.port()));
    write.write_all(handshake.request().as_bytes()).await.unwrap();
    let head = read_handshake_head(&mut reader).await.unwrap();
    handshake.verify_response(&head).unwrap();
    (reader, write)
}

async fn send_masked(write: &mut OwnedWriteHalf, frame: Frame) {
    write_frame(write, &frame.with_mask(MASK)).await.unwrap();
}

async fn next_frame(reader: &mut BufReader<OwnedReadHalf>) -> Frame {
    timeout(WAIT, read_frame(reader, Role::Client, usize::MAX))
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended before a frame arrived")
}

/// Asserts that the server closes the socket without sending anything more.
async fn expect_closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut rest = Vec::new();
    timeout(WAIT, reader.read_to_end(&mut rest))
        .await
        .expect("server did not close the socket")
        .ok();
    assert!(rest.is_empty(), "unexpected bytes before close: {rest:?}");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Connectivity ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_receives_greeting_for_text_message() {
    // Arrange
    let (server, addr, mut observed) = start_server(test_config()).await;
    let conn = connect("127.0.0.1", addr.port(), ClientOptions::default())
        .await
        .unwrap();
    let (tx, mut replies) = mpsc::unbounded_channel();
    conn.on(EventKind::Text, move |_, payload| {
        let _ = tx.send(payload.to_vec());
        Ok(())
    });
    conn.serve();

    // Act
    conn.send_text("Hello?").unwrap();

    // Assert
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply, b"Hello!");
    let received = timeout(WAIT, observed.texts.recv()).await.unwrap().unwrap();
    assert_eq!(received, b"Hello?");

    conn.close().unwrap();
    timeout(WAIT, conn.closed()).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_connect_and_disconnect_events_carry_same_connection() {
    let (server, addr, mut observed) = start_server(test_config()).await;

    let (_reader, mut write) = raw_upgrade(addr).await;
    let connected = timeout(WAIT, observed.connects.recv()).await.unwrap().unwrap();
    write.shutdown().await.unwrap();
    let disconnected = timeout(WAIT, observed.disconnects.recv()).await.unwrap().unwrap();

    assert_eq!(connected, disconnected);
    server.stop().await;
}

#[tokio::test]
async fn test_connected_clients_tracks_live_connections() {
    let (server, addr, _observed) = start_server(test_config()).await;

    let first = raw_upgrade(addr).await;
    let second = raw_upgrade(addr).await;
    wait_until(|| server.connected_clients().len() == 2).await;

    drop(first);
    wait_until(|| server.connected_clients().len() == 1).await;

    drop(second);
    wait_until(|| server.connected_clients().is_empty()).await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_side_connection_exposes_request_details() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let options = ClientOptions {
        path: "/chat".to_string(),
        origin: Some("http://example.com".to_string()),
        ..ClientOptions::default()
    };

    let _conn = connect("127.0.0.1", addr.port(), options).await.unwrap();
    wait_until(|| server.connected_clients().len() == 1).await;
    let remote = server.connected_clients().remove(0);

    assert_eq!(remote.role(), Role::Server);
    assert_eq!(remote.path(), Some("/chat"));
    assert_eq!(remote.origin(), Some("http://example.com"));
    assert!(remote.peer_addr().is_some());
    server.stop().await;
}

// ── Control frames ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_is_answered_with_pong_echoing_payload() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::ping(&b"are you there"[..])).await;
    let reply = next_frame(&mut reader).await;

    assert_eq!(reply.opcode, Opcode::Pong);
    assert!(reply.fin);
    assert!(!reply.is_masked());
    assert_eq!(reply.payload, b"are you there");
    server.stop().await;
}

#[tokio::test]
async fn test_client_initiated_close_is_answered_then_socket_closes() {
    let (server, addr, mut observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::close()).await;
    let reply = next_frame(&mut reader).await;

    assert_eq!(reply.opcode, Opcode::Close);
    expect_closed(&mut reader).await;
    timeout(WAIT, observed.disconnects.recv()).await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_server_initiated_close_ends_after_client_reply() {
    let (server, addr, mut observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;
    wait_until(|| server.connected_clients().len() == 1).await;

    // Act: close from the server side
    server.connected_clients()[0].close().unwrap();
    let close = next_frame(&mut reader).await;
    assert_eq!(close.opcode, Opcode::Close);
    send_masked(&mut write, Frame::close()).await;

    // Assert: no second Close from the server, just end of stream
    expect_closed(&mut reader).await;
    timeout(WAIT, observed.disconnects.recv()).await.unwrap().unwrap();
    server.stop().await;
}

// ── Protocol violations ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_opcode_closes_connection() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    // FIN + reserved opcode 0x3, masked, empty payload.
    write.write_all(&[0x83, 0x80, 1, 2, 3, 4]).await.unwrap();

    expect_closed(&mut reader).await;
    server.stop().await;
}

#[tokio::test]
async fn test_continuation_without_start_closes_connection() {
    let (server, addr, mut observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::new(Opcode::Continuation, true, &b"orphan"[..])).await;

    expect_closed(&mut reader).await;
    assert!(observed.texts.try_recv().is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_fragmented_close_closes_connection() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::new(Opcode::Close, false, Vec::new())).await;

    // No Close reply: the frame itself is illegal.
    expect_closed(&mut reader).await;
    server.stop().await;
}

#[tokio::test]
async fn test_unmasked_client_frame_closes_connection() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    write_frame(&mut write, &Frame::text(&b"plain"[..])).await.unwrap();

    expect_closed(&mut reader).await;
    server.stop().await;
}

#[tokio::test]
async fn test_payload_over_limit_closes_connection() {
    let config = ServerConfig {
        max_payload_len: 64,
        ..test_config()
    };
    let (server, addr, _observed) = start_server(config).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::binary(vec![0u8; 65])).await;

    expect_closed(&mut reader).await;
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_mid_frame_emits_disconnect_without_message() {
    // A masked 300-byte text frame: 2 fixed bytes, a 16-bit length, a
    // 4-byte mask, then the body.
    let frame = encode_frame(&Frame::text(vec![b'a'; 300]).with_mask(MASK));
    assert_eq!(frame[1], 0x80 | 126);
    let cut_points = [
        ("after the opcode byte", 1),
        ("inside the extended length", 3),
        ("inside the mask key", 6),
        ("right after the mask key", 8),
        ("in the middle of the body", 8 + 150),
    ];

    let (server, addr, mut observed) = start_server(test_config()).await;
    for (label, cut) in cut_points {
        // Arrange
        let (_reader, mut write) = raw_upgrade(addr).await;
        let connected = timeout(WAIT, observed.connects.recv()).await.unwrap().unwrap();

        // Act: send part of the frame, then hang up
        write.write_all(&frame[..cut]).await.unwrap();
        write.shutdown().await.unwrap();

        // Assert
        let disconnected = timeout(WAIT, observed.disconnects.recv())
            .await
            .unwrap_or_else(|_| panic!("no disconnect when cut {label}"))
            .unwrap();
        assert_eq!(disconnected, connected, "cut {label}");
        assert!(observed.texts.try_recv().is_err(), "partial frame emitted when cut {label}");
        wait_until(|| server.connected_clients().is_empty()).await;
    }
    server.stop().await;
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fragmented_text_is_reassembled_with_interleaved_ping() {
    let (server, addr, mut observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;

    send_masked(&mut write, Frame::new(Opcode::Text, false, &b"Hel"[..])).await;
    send_masked(&mut write, Frame::ping(&b"p"[..])).await;
    send_masked(&mut write, Frame::new(Opcode::Continuation, true, &b"lo"[..])).await;

    let pong = next_frame(&mut reader).await;
    assert_eq!(pong.opcode, Opcode::Pong);
    let greeting = next_frame(&mut reader).await;
    assert_eq!(greeting.opcode, Opcode::Text);
    assert_eq!(greeting.payload, b"Hello!");
    let received = timeout(WAIT, observed.texts.recv()).await.unwrap().unwrap();
    assert_eq!(received, b"Hello");
    server.stop().await;
}

#[tokio::test]
async fn test_payload_larger_than_read_chunk_round_trips() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, mut write) = raw_upgrade(addr).await;
    let payload: Vec<u8> = (0..1025u32).map(|i| (i % 251) as u8).collect();

    send_masked(&mut write, Frame::binary(payload.clone())).await;
    let echo = next_frame(&mut reader).await;

    assert_eq!(echo.opcode, Opcode::Binary);
    assert_eq!(echo.payload, payload);
    server.stop().await;
}

// ── Handshake failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_key_gets_400_with_reason() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        addr.port()
    );

    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.ends_with("Received invalid websocket request (missing key)"));
    assert!(server.connected_clients().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    let config = ServerConfig {
        handshake_timeout_secs: 1,
        ..test_config()
    };
    let (server, addr, _observed) = start_server(config).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut rest = Vec::new();
    let read = timeout(WAIT, stream.read_to_end(&mut rest)).await;

    assert!(read.is_ok(), "server kept the silent socket open");
    assert!(rest.is_empty());
    server.stop().await;
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_disconnects_clients_and_frees_port() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut reader, _write) = raw_upgrade(addr).await;
    wait_until(|| server.connected_clients().len() == 1).await;

    timeout(WAIT, server.stop()).await.unwrap();

    assert!(!server.is_running());
    assert!(server.connected_clients().is_empty());
    let read = timeout(WAIT, read_frame(&mut reader, Role::Client, usize::MAX))
        .await
        .unwrap();
    assert!(matches!(read, Err(ReadError::Closed) | Err(ReadError::Io(_))));
    assert!(TcpStream::connect(addr).await.is_err());
}

// ── Interoperability ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tungstenite_client_talks_to_server() {
    let (server, addr, _observed) = start_server(test_config()).await;
    let (mut ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
        .await
        .unwrap();

    ws.send(WsMessage::Text("Hello?".into())).await.unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, WsMessage::Text("Hello!".into()));

    // 70 000 bytes forces the 64-bit length form.
    let big = vec![7u8; 70_000];
    ws.send(WsMessage::Binary(big.clone())).await.unwrap();
    let echo = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(echo, WsMessage::Binary(big));

    ws.send(WsMessage::Ping(b"tick".to_vec())).await.unwrap();
    let pong = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(pong, WsMessage::Pong(b"tick".to_vec()));

    ws.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_client_talks_to_tungstenite_server() {
    // Arrange: a tungstenite echo server
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let echo_server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_text() || message.is_binary() {
                ws.send(message).await.unwrap();
            }
        }
    });

    let conn = connect("127.0.0.1", port, ClientOptions::default())
        .await
        .unwrap();
    let (tx, mut echoes) = mpsc::unbounded_channel();
    let binary_tx = tx.clone();
    conn.on(EventKind::Text, move |_, payload| {
        let _ = tx.send(payload.to_vec());
        Ok(())
    });
    conn.on(EventKind::Binary, move |_, payload| {
        let _ = binary_tx.send(payload.to_vec());
        Ok(())
    });
    conn.serve();

    // Act
    conn.send_text("round trip").unwrap();
    let big = vec![0xa5u8; 70_000];
    conn.send_binary(&big).unwrap();

    // Assert
    assert_eq!(timeout(WAIT, echoes.recv()).await.unwrap().unwrap(), b"round trip");
    assert_eq!(timeout(WAIT, echoes.recv()).await.unwrap().unwrap(), big);

    conn.close().unwrap();
    timeout(WAIT, conn.closed()).await.unwrap();
    timeout(WAIT, echo_server).await.unwrap().unwrap();
}
