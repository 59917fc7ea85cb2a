//! Sweeper behavior against live nodes.

use std::time::Duration;

use crate::*;
use causeway_services::DeliveryFailure;
use causewayd::sweeper;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// An established link with nothing moving on it gets closed once it
/// passes the idle limit.
#[tokio::test]
async fn idle_links_are_swept() {
    let net = TestNet::new();
    let mut config = node_config("a.example", "secret-a");
    config.federation.idle_timeout_secs = 1;
    let a = start_with(&net, config, true).await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    a.send("bob@b.example", "alice@a.example", json!("only packet"))
        .await;
    b.expect_delivered().await;

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(sweeper::run(a.fed.clone(), shutdown_tx.subscribe()));

    tokio::time::sleep(Duration::from_secs(3)).await;

    let counts = a.fed.registry.lock().await.link_counts();
    assert_eq!(counts.0, 0, "idle outbound link should be gone");
    assert!(a
        .reachable_events()
        .contains(&("b.example".to_string(), false)));
    drop(shutdown_tx);
}

/// Packets stuck behind a handshake that never finishes are failed back
/// at the queue timeout, without waiting for the handshake itself.
#[tokio::test]
async fn queued_packets_time_out() {
    let net = TestNet::new();
    let mut config = node_config("a.example", "secret-a");
    config.network.connect_timeout_secs = 30;
    config.federation.queue_timeout_secs = 1;
    let mut a = start_with(&net, config, true).await;

    // Accepts the connection, then says nothing at all.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    net.add("slow.example", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut parked = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            parked.push(stream);
        }
    });

    a.send("x@slow.example", "alice@a.example", json!("stuck"))
        .await;

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(sweeper::run(a.fed.clone(), shutdown_tx.subscribe()));

    let (envelope, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::Timeout);
    assert_eq!(envelope.to, "x@slow.example");
    drop(shutdown_tx);
}
