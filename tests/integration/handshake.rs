//! Verified-trust handshakes between live nodes.

use std::net::SocketAddr;
use std::time::Duration;

use crate::*;
use causeway_core::keys::dialback_key;
use causeway_core::wire::{Frame, StreamHeader};
use causeway_services::{DeliveryFailure, Link, LinkTable};
use causewayd::net::{open_link, FrameReader};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Open a raw stream to a node, declare dialback support as `a.example`,
/// and return the link, the reader, and the challenge id handed out in
/// the answering header.
async fn open_claim_stream(addr: SocketAddr) -> (Link, FrameReader, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (link, mut reader) = open_link(stream);
    link.send(Frame::Header(StreamHeader::opening("a.example")));
    let challenge = match reader.next().await.unwrap().unwrap() {
        Frame::Header(h) => h.id.expect("answering header carries a challenge id"),
        other => panic!("expected answering header, got {other:?}"),
    };
    (link, reader, challenge)
}

/// Next trust decision on a raw stream, skipping unrelated frames.
async fn next_claim_result(reader: &mut FrameReader) -> bool {
    timeout(Duration::from_secs(5), async {
        loop {
            match reader.next().await.expect("claim stream broke") {
                Some(Frame::ClaimResult { valid, .. }) => return valid,
                Some(_) => continue,
                None => panic!("stream closed before a claim result"),
            }
        }
    })
    .await
    .expect("timed out waiting for a claim result")
}

/// Two nodes, fresh state, one packet each way. Each direction earns its
/// own verified link.
#[tokio::test]
async fn packet_round_trip() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    a.send("bob@b.example", "alice@a.example", json!({"body": "hello"}))
        .await;
    let delivered = b.expect_delivered().await;
    assert_eq!(delivered.to, "bob@b.example");
    assert_eq!(delivered.from, "alice@a.example");
    assert_eq!(payload_of(&delivered), json!({"body": "hello"}));

    b.send("alice@a.example", "bob@b.example", json!({"body": "hi back"}))
        .await;
    let reply = a.expect_delivered().await;
    assert_eq!(payload_of(&reply), json!({"body": "hi back"}));
}

/// Packets sent while the handshake is in flight queue up and flush in
/// arrival order once the pair is trusted.
#[tokio::test]
async fn queued_packets_flush_in_order() {
    let net = TestNet::new();
    let a = start_node(&net, "a.example", "secret-a").await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    for n in 0..5 {
        a.send("bob@b.example", "alice@a.example", json!(n)).await;
    }
    for n in 0..5 {
        let delivered = b.expect_delivered().await;
        assert_eq!(payload_of(&delivered), json!(n), "packet {n} out of order");
    }
}

/// A node claiming a domain it does not hold the secret for: the
/// challenge goes to the real holder, the answer is invalid, and the
/// impostor's packets fail without ever reaching the target.
#[tokio::test]
async fn impostor_claim_is_refused() {
    let net = TestNet::new();
    let _real = start_node(&net, "a.example", "real-secret").await;
    let mut b = start_node(&net, "b.example", "secret-b").await;
    let mut evil = start_with(&net, node_config("a.example", "stolen-guess"), false).await;

    evil.send("bob@b.example", "alice@a.example", json!({"body": "trust me"}))
        .await;

    let (envelope, reason) = evil.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::Refused);
    assert_eq!(envelope.to, "bob@b.example");
    assert!(b.no_delivery_yet(), "impostor packet must never be delivered");
}

/// A claimed origin nobody can connect back to can never be verified, so
/// the claim is rejected.
#[tokio::test]
async fn unreachable_origin_claim_is_refused() {
    let net = TestNet::new();
    let _b = start_node(&net, "b.example", "secret-b").await;
    let mut ghost = start_unlisted_node(&net, "ghost.example", "secret-g").await;

    ghost
        .send("bob@b.example", "alice@ghost.example", json!({"body": "boo"}))
        .await;

    let (_, reason) = ghost.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::Refused);
}

/// A domain misrouted to our own listener: the challenge id in the
/// answering header is one we generated ourselves, so the attempt is
/// abandoned instead of handshaking with ourselves.
#[tokio::test]
async fn self_loop_is_refused() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;
    net.add("mirror.example", a.addr);

    a.send("x@mirror.example", "alice@a.example", json!({"body": "echo"}))
        .await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::ConnectFailed);
}

/// A rejected claim is advisory for the claimant's stream: the stream
/// stays open and a later, correctly derived claim on it still succeeds.
#[tokio::test]
async fn invalid_claim_leaves_stream_open() {
    let net = TestNet::new();
    let _a = start_node(&net, "a.example", "real-secret").await;
    let b = start_node(&net, "b.example", "secret-b").await;

    let (link, mut reader, challenge) = open_claim_stream(b.addr).await;

    link.send(Frame::Claim {
        to: "b.example".into(),
        from: "a.example".into(),
        key: "not-the-derived-key".into(),
    });
    assert!(!next_claim_result(&mut reader).await, "bogus key must be rejected");

    link.send(Frame::Claim {
        to: "b.example".into(),
        from: "a.example".into(),
        key: dialback_key("real-secret", "b.example", &challenge),
    });
    assert!(
        next_claim_result(&mut reader).await,
        "stream must survive the rejection and still verify a good claim"
    );
}

/// A challenge relayed over a trusted link whose writer is already gone
/// must resolve the claim as invalid instead of losing the challenge and
/// leaving the claimant hanging.
#[tokio::test]
async fn dead_relay_link_still_resolves_the_claim() {
    let net = TestNet::new();
    let b = start_node(&net, "b.example", "secret-b").await;

    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    b.fed.registry.lock().await.register(
        LinkTable::OutboundDialback,
        "b.example/a.example".into(),
        Link::new(tx),
    );

    let (link, mut reader, _challenge) = open_claim_stream(b.addr).await;
    link.send(Frame::Claim {
        to: "b.example".into(),
        from: "a.example".into(),
        key: "whatever".into(),
    });
    assert!(!next_claim_result(&mut reader).await);
}

/// One server holding several domains verifies each origin separately on
/// the same remote.
#[tokio::test]
async fn multiplexed_origins_verify_independently() {
    let net = TestNet::new();
    let mut config = node_config("a1.example", "secret-a");
    config.identity.domains.push("a2.example".to_string());
    let a = start_with(&net, config, true).await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    a.send("bob@b.example", "alice@a1.example", json!("from a1"))
        .await;
    a.send("bob@b.example", "alice@a2.example", json!("from a2"))
        .await;

    let mut froms = vec![
        b.expect_delivered().await.from,
        b.expect_delivered().await.from,
    ];
    froms.sort();
    assert_eq!(froms, vec!["alice@a1.example", "alice@a2.example"]);
}
