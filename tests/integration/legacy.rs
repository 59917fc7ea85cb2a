//! Peers that do not speak the verification protocol.
//!
//! The raw peer side of these tests drives the wire format by hand over
//! plain sockets, the way an old implementation would.

use crate::*;
use causeway_core::wire::{Frame, StreamHeader, NAMESPACE};
use causeway_services::DeliveryFailure;
use causewayd::net::open_link;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};

fn legacy_opening(origin: &str) -> StreamHeader {
    StreamHeader {
        ns: NAMESPACE.to_string(),
        from: Some(origin.to_string()),
        dialback: false,
        id: None,
    }
}

/// A legacy remote, when allowed, gets packets straight after the header
/// exchange — no claim, no challenge.
#[tokio::test]
async fn outbound_to_legacy_peer_when_allowed() {
    let net = TestNet::new();
    let mut config = node_config("a.example", "secret-a");
    config.federation.legacy_allowed = true;
    let a = start_with(&net, config, true).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    net.add("legacy.example", listener.local_addr().unwrap());

    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (link, mut reader) = open_link(stream);
        let opening = reader.next().await.unwrap().unwrap();
        assert!(matches!(opening, Frame::Header(_)));
        link.send(Frame::Header(StreamHeader::accepting(false, None)));
        // First thing after the headers must be the packet itself.
        reader.next().await.unwrap().unwrap()
    });

    a.send("old@legacy.example", "alice@a.example", json!("plain"))
        .await;

    match peer.await.unwrap() {
        Frame::Packet { payload, .. } => assert_eq!(payload, json!("plain")),
        other => panic!("expected the packet, got {other:?}"),
    }
}

/// With legacy disabled (the default), an unverifiable remote is cut off
/// and the packets fail.
#[tokio::test]
async fn outbound_to_legacy_peer_refused_by_default() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    net.add("legacy.example", listener.local_addr().unwrap());

    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (link, mut reader) = open_link(stream);
        let _opening = reader.next().await.unwrap().unwrap();
        link.send(Frame::Header(StreamHeader::accepting(false, None)));
        let mut saw_error = false;
        while let Ok(Some(frame)) = reader.next().await {
            if matches!(frame, Frame::Error { .. }) {
                saw_error = true;
            }
        }
        saw_error
    });

    a.send("old@legacy.example", "alice@a.example", json!("plain"))
        .await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::ConnectFailed);
    assert!(peer.await.unwrap(), "remote should see a protocol error");
}

/// An inbound legacy opener, when allowed, is trusted on connectivity
/// alone and its packets flow without any verification step.
#[tokio::test]
async fn inbound_legacy_peer_when_allowed() {
    let net = TestNet::new();
    let mut config = node_config("b.example", "secret-b");
    config.federation.legacy_allowed = true;
    let mut b = start_with(&net, config, true).await;

    let stream = TcpStream::connect(b.addr).await.unwrap();
    let (link, mut reader) = open_link(stream);
    link.send(Frame::Header(legacy_opening("old.example")));
    let answer = reader.next().await.unwrap().unwrap();
    match answer {
        Frame::Header(h) => assert!(!h.dialback && h.id.is_none()),
        other => panic!("expected answering header, got {other:?}"),
    }
    link.send(Frame::Packet {
        to: "bob@b.example".into(),
        from: "old@old.example".into(),
        payload: json!("from the past"),
    });

    let delivered = b.expect_delivered().await;
    assert_eq!(delivered.from, "old@old.example");
    assert_eq!(payload_of(&delivered), json!("from the past"));
}

#[tokio::test]
async fn inbound_legacy_peer_rejected_by_default() {
    let net = TestNet::new();
    let b = start_node(&net, "b.example", "secret-b").await;

    let stream = TcpStream::connect(b.addr).await.unwrap();
    let (link, mut reader) = open_link(stream);
    link.send(Frame::Header(legacy_opening("old.example")));

    let mut saw_error = false;
    while let Ok(Some(frame)) = reader.next().await {
        if matches!(frame, Frame::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error, "expected a terminal protocol error");
}
