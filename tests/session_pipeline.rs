//! End-to-end tests for the session layer against a scripted host socket.

use std::time::Duration;

use bytes::Bytes;
use fixline::codec;
use fixline::dictionary::Dictionary;
use fixline::session::{FixSession, SessionConfig, SessionState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

fn field(text: &str) -> Bytes {
    Bytes::from(format!("{text}\x01"))
}

fn order_fields(cl_ord_id: &str) -> Vec<Bytes> {
    vec![
        field("35=D"),
        field("49=LOCAL"),
        field("56=HOST"),
        field("52=20240101-00:00:00.000"),
        field(&format!("11={cl_ord_id}")),
        field("55=TEST"),
        field("54=1"),
        field("60=20240101-00:00:00.000"),
        field("40=1"),
    ]
}

fn host_heartbeat(seq: u64) -> Bytes {
    let fields = vec![
        field("35=0"),
        field("49=HOST"),
        field("56=LOCAL"),
        field("52=20240101-00:00:00.000"),
    ];
    codec::compile(&fields, seq).unwrap()
}

async fn start_session(
    heartbeat_secs: u64,
) -> (
    FixSession,
    mpsc::UnboundedReceiver<Option<Bytes>>,
    TcpStream,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SessionConfig::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .sender_comp_id("LOCAL")
        .target_comp_id("HOST")
        .heartbeat_interval_secs(heartbeat_secs)
        .build()
        .unwrap();
    let mut session = FixSession::new(config, Dictionary::builtin());
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let (api_tx, api_rx) = mpsc::unbounded_channel();
    session.connect(api_tx).await.unwrap();
    let host = accept.await.unwrap();
    (session, api_rx, host)
}

/// Writes one wire message and pauses so the session sees it as its own
/// transport read.
async fn host_send(host: &mut TcpStream, message: &[u8]) {
    host.write_all(message).await.unwrap();
    host.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
}

fn frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\x0110=")
        .map(|i| i + 8)
        .filter(|end| *end <= buf.len())
}

async fn read_message(host: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
    loop {
        if let Some(end) = frame_end(buf) {
            return buf.drain(..end).collect();
        }
        let mut chunk = [0u8; 4096];
        let n = timeout(Duration::from_secs(10), host.read(&mut chunk))
            .await
            .expect("timed out waiting for a message")
            .unwrap();
        assert!(n > 0, "host connection closed");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn next_delivery(api_rx: &mut mpsc::UnboundedReceiver<Option<Bytes>>) -> Bytes {
    timeout(Duration::from_secs(10), api_rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("api channel closed")
        .expect("unexpected poison sentinel")
}

fn decompiled(message: &[u8]) -> std::collections::HashMap<String, Bytes> {
    codec::decompile(&Dictionary::builtin(), message).unwrap()
}

fn seq_of(message: &[u8]) -> u64 {
    std::str::from_utf8(&decompiled(message)["MsgSeqNum"])
        .unwrap()
        .parse()
        .unwrap()
}

fn msg_type_of(message: &[u8]) -> String {
    String::from_utf8(decompiled(message)["MsgType"].to_vec()).unwrap()
}

#[tokio::test]
async fn outbound_sequence_is_monotonic() {
    let (session, _api_rx, mut host) = start_session(30).await;
    for k in 1..=5u64 {
        session
            .enqueue(order_fields(&format!("ord-{k}")), "message")
            .unwrap();
    }
    let mut buf = Vec::new();
    for k in 1..=5u64 {
        let message = read_message(&mut host, &mut buf).await;
        assert_eq!(seq_of(&message), k);
        assert_eq!(msg_type_of(&message), "D");
    }
    drop(session);
}

#[tokio::test]
async fn compile_failure_does_not_burn_a_sequence_number() {
    let (session, _api_rx, mut host) = start_session(30).await;
    session.enqueue(vec![field("49=LOCAL")], "message").unwrap();
    session.enqueue(order_fields("ord-1"), "message").unwrap();
    let mut buf = Vec::new();
    let message = read_message(&mut host, &mut buf).await;
    assert_eq!(seq_of(&message), 1);
    assert_eq!(msg_type_of(&message), "D");
    drop(session);
}

#[tokio::test]
async fn heartbeat_after_outbound_silence() {
    let (_session, _api_rx, mut host) = start_session(2).await;
    let started = Instant::now();
    let mut buf = Vec::new();
    let message = read_message(&mut host, &mut buf).await;
    let elapsed = started.elapsed();
    assert_eq!(msg_type_of(&message), "0");
    assert_eq!(seq_of(&message), 1);
    assert!(
        elapsed >= Duration::from_millis(500),
        "heartbeat too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(2500),
        "heartbeat too late: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_request_after_inbound_silence() {
    let (_session, _api_rx, mut host) = start_session(2).await;
    let started = Instant::now();
    let mut buf = Vec::new();
    loop {
        let message = read_message(&mut host, &mut buf).await;
        if msg_type_of(&message) != "1" {
            assert!(
                started.elapsed() < Duration::from_secs(8),
                "no TestRequest seen"
            );
            continue;
        }
        let fields = decompiled(&message);
        assert!(!fields["TestReqID"].is_empty());
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(2500),
            "TestRequest too early: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(4500),
            "TestRequest too late: {elapsed:?}"
        );
        return;
    }
}

#[tokio::test]
async fn split_message_is_reassembled() {
    let (_session, mut api_rx, mut host) = start_session(30).await;
    let message = host_heartbeat(1);
    let split_at = message.len() - 9;
    host.write_all(&message[..split_at]).await.unwrap();
    host.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    host.write_all(&message[split_at..]).await.unwrap();

    let delivered = next_delivery(&mut api_rx).await;
    assert_eq!(delivered.as_ref(), message.as_ref());
}

#[tokio::test]
async fn abandoned_partial_gives_way_to_the_next_message() {
    let (_session, mut api_rx, mut host) = start_session(30).await;
    let full = host_heartbeat(1);
    // A truncated frame, then a complete one starting with a fresh header.
    host_send(&mut host, &full[..full.len() - 9]).await;
    host_send(&mut host, &full).await;
    let delivered = next_delivery(&mut api_rx).await;
    assert_eq!(delivered.as_ref(), full.as_ref());
}

#[tokio::test]
async fn gap_triggers_one_resend_request_and_recovers() {
    let (_session, mut api_rx, mut host) = start_session(30).await;

    host_send(&mut host, &host_heartbeat(1)).await;
    host_send(&mut host, &host_heartbeat(2)).await;
    for want in 1..=2u64 {
        assert_eq!(seq_of(&next_delivery(&mut api_rx).await), want);
    }

    // Jump to 4: the session asks for a resend from 3 and drops the frame.
    host_send(&mut host, &host_heartbeat(4)).await;
    let mut buf = Vec::new();
    let resend = read_message(&mut host, &mut buf).await;
    assert_eq!(msg_type_of(&resend), "2");
    assert_eq!(seq_of(&resend), 1);
    let fields = decompiled(&resend);
    assert_eq!(fields["BeginSeqNo"].as_ref(), b"3");
    assert_eq!(fields["EndSeqNo"].as_ref(), b"0");

    // Still out of order while a resend is pending: no second request.
    host_send(&mut host, &host_heartbeat(6)).await;
    let mut chunk = [0u8; 1024];
    let quiet = timeout(Duration::from_millis(300), host.read(&mut chunk)).await;
    assert!(quiet.is_err(), "unexpected traffic after repeated gap");
    assert!(api_rx.try_recv().is_err());

    // In-order delivery resumes and clears the resend state.
    for seq in 3..=5u64 {
        host_send(&mut host, &host_heartbeat(seq)).await;
    }
    for want in 3..=5u64 {
        assert_eq!(seq_of(&next_delivery(&mut api_rx).await), want);
    }
}

#[tokio::test]
async fn corrupt_checksum_drops_message_and_keeps_host_seq() {
    let (_session, mut api_rx, mut host) = start_session(30).await;

    let good = host_heartbeat(1);
    assert_ne!(&good[good.len() - 4..good.len() - 1], b"000");
    let mut bad = good.to_vec();
    let at = bad.len() - 4;
    bad[at..at + 3].copy_from_slice(b"000");
    host_send(&mut host, &bad).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(api_rx.try_recv().is_err());

    // Seq 1 must still be acceptable: the bad frame burned nothing.
    host_send(&mut host, &good).await;
    assert_eq!(seq_of(&next_delivery(&mut api_rx).await), 1);
}

#[tokio::test]
async fn inbound_test_request_is_answered() {
    let (_session, mut api_rx, mut host) = start_session(30).await;
    let ping = vec![
        field("35=1"),
        field("49=HOST"),
        field("56=LOCAL"),
        field("52=20240101-00:00:00.000"),
        field("112=ping-7"),
    ];
    host_send(&mut host, &codec::compile(&ping, 1).unwrap()).await;

    // Forwarded unchanged to the api...
    assert_eq!(msg_type_of(&next_delivery(&mut api_rx).await), "1");

    // ...and answered with a heartbeat echoing the id.
    let mut buf = Vec::new();
    let reply = read_message(&mut host, &mut buf).await;
    assert_eq!(msg_type_of(&reply), "0");
    assert_eq!(decompiled(&reply)["TestReqID"].as_ref(), b"ping-7");
}

#[tokio::test]
async fn disconnect_is_terminal() {
    let (mut session, mut api_rx, _host) = start_session(30).await;
    assert_eq!(session.state(), SessionState::Active);
    session.disconnect();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.enqueue(order_fields("x"), "message").is_err());

    let final_item = timeout(Duration::from_secs(5), api_rx.recv())
        .await
        .expect("inbound worker did not unwind");
    assert!(final_item.is_none());
}

#[tokio::test]
async fn remote_close_closes_session() {
    let (session, mut api_rx, host) = start_session(30).await;
    drop(host);
    let final_item = timeout(Duration::from_secs(5), api_rx.recv())
        .await
        .expect("inbound worker did not unwind");
    assert!(final_item.is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Closed {
        assert!(Instant::now() < deadline, "session never closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
