//! End-to-end upgrade path over real localhost sockets: HTTP request in,
//! `101 Switching Protocols` out, then WebSocket frames flowing through
//! the promoted connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use dullahan::http::{PendingConn, PendingOutcome};
use dullahan::protocol::{self, ClientMessage};
use dullahan::ws::{WsConnection, WsMessage};

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Accept one socket and wrap it in a pending connection.
fn pending_pair() -> (PendingConn, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let peer = TcpStream::connect(addr).expect("connect");
    let (sock, peer_addr) = listener.accept().expect("accept");
    sock.set_nonblocking(true).expect("nonblocking");
    (PendingConn::new_plain(sock, peer_addr), peer)
}

/// Drive a pending connection until it resolves or times out.
fn drive(mut pending: PendingConn) -> PendingOutcome {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match pending.advance(None) {
            PendingOutcome::Pending => {
                assert!(Instant::now() < deadline, "pending connection stalled");
                std::thread::sleep(Duration::from_millis(5));
            }
            outcome => return outcome,
        }
    }
}

/// Build a masked client frame (clients MUST mask).
fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    let mask = [0x12u8, 0x34, 0x56, 0x78];
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x81); // FIN + text
    if payload.len() <= 125 {
        out.push(0x80 | payload.len() as u8);
    } else {
        assert!(payload.len() <= u16::MAX as usize);
        out.push(0x80 | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    out
}

fn read_response_head(peer: &mut TcpStream) -> String {
    peer.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = peer.read(&mut byte).expect("read response");
        assert!(n > 0, "peer closed before end of headers");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("utf8 response head")
}

#[test]
fn valid_upgrade_yields_101_with_accept_key() {
    let (pending, mut peer) = pending_pair();
    write!(
        peer,
        "GET / HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
    .expect("write request");

    let outcome = drive(pending);
    let conn = match outcome {
        PendingOutcome::Upgraded(conn) => conn,
        other => panic!("expected upgrade, got {other:?}"),
    };

    let head = read_response_head(&mut peer);
    assert!(head.starts_with("HTTP/1.1 101"), "head: {head}");
    assert!(
        head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")),
        "head: {head}"
    );

    drop(conn);
}

#[test]
fn hello_flows_through_upgraded_connection() {
    let (pending, mut peer) = pending_pair();
    write!(
        peer,
        "GET /attach HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: keep-alive, Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         \r\n"
    )
    .expect("write request");

    let mut conn: WsConnection = match drive(pending) {
        PendingOutcome::Upgraded(conn) => *conn,
        other => panic!("expected upgrade, got {other:?}"),
    };
    let _head = read_response_head(&mut peer);

    // Client sends a hello as a masked text frame.
    let hello = br#"{"type":"hello","clientId":"c1"}"#;
    peer.write_all(&masked_text_frame(hello)).expect("write frame");

    // The server side reads it back out of the promoted connection.
    let deadline = Instant::now() + Duration::from_secs(5);
    let message = loop {
        match conn.read_message().expect("read_message") {
            Some(msg) => break msg,
            None => {
                assert!(Instant::now() < deadline, "no frame arrived");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    };

    let payload = match message {
        WsMessage::Text(payload) => payload,
        other => panic!("expected text frame, got {other:?}"),
    };
    let parsed = protocol::decode_json(&payload).expect("decode hello");
    assert_eq!(
        parsed,
        ClientMessage::Hello {
            client_id: "c1".to_string(),
            theme_fg: None,
            theme_bg: None,
            token: None,
        }
    );
}

#[test]
fn non_upgrade_request_is_served_and_closed() {
    let (pending, mut peer) = pending_pair();
    write!(peer, "GET /missing.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("write request");

    match drive(pending) {
        PendingOutcome::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }

    // With no static root configured everything is a 404.
    let head = read_response_head(&mut peer);
    assert!(head.starts_with("HTTP/1.1 404"), "head: {head}");
}

#[test]
fn oversized_headers_get_431() {
    let (pending, mut peer) = pending_pair();

    // A header block comfortably past the 16 KiB cap, never terminated.
    let filler = "y".repeat(20 * 1024);
    write!(peer, "GET / HTTP/1.1\r\nx-fill: {filler}\r\n").expect("write request");

    match drive(pending) {
        PendingOutcome::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }

    let head = read_response_head(&mut peer);
    assert!(head.starts_with("HTTP/1.1 431"), "head: {head}");
}

#[test]
fn request_straddling_packets_still_upgrades() {
    let (mut pending, mut peer) = pending_pair();

    // Trickle the request in three fragments with advances in between.
    let request = format!(
        "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    let bytes = request.as_bytes();
    let thirds = bytes.len() / 3;

    for chunk in [&bytes[..thirds], &bytes[thirds..2 * thirds]] {
        peer.write_all(chunk).expect("write chunk");
        peer.flush().expect("flush");
        std::thread::sleep(Duration::from_millis(20));
        match pending.advance(None) {
            PendingOutcome::Pending => {}
            other => panic!("resolved too early: {other:?}"),
        }
    }
    peer.write_all(&bytes[2 * thirds..]).expect("write tail");

    match drive(pending) {
        PendingOutcome::Upgraded(_) => {}
        other => panic!("expected upgrade, got {other:?}"),
    }
    let head = read_response_head(&mut peer);
    assert!(head.starts_with("HTTP/1.1 101"));
}
