//! Dispatch and failure-path behavior.

use std::time::Duration;

use crate::*;
use causeway_services::{DeliveryFailure, LinkTable};
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::test]
async fn unresolvable_target_fails() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    a.send("nobody@nowhere.example", "alice@a.example", json!("lost"))
        .await;

    let (envelope, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::NoAddress);
    assert_eq!(envelope.to, "nobody@nowhere.example");
}

#[tokio::test]
async fn refused_connection_fails() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    // A port that was bound once and is now closed.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    net.add("dead.example", dead_addr);

    a.send("x@dead.example", "alice@a.example", json!("knock"))
        .await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::ConnectFailed);
}

/// A destination we host ourselves never touches the network.
#[tokio::test]
async fn local_destination_loops_back() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    a.send("self@a.example", "alice@a.example", json!("note to self"))
        .await;

    let delivered = a.expect_delivered().await;
    assert_eq!(payload_of(&delivered), json!("note to self"));
}

/// We can only claim trust for domains we hold; anything else is refused
/// before a connection is even attempted.
#[tokio::test]
async fn non_local_origin_is_refused() {
    let net = TestNet::new();
    let _b = start_node(&net, "b.example", "secret-b").await;
    let mut a = start_node(&net, "a.example", "secret-a").await;

    a.send("bob@b.example", "mallory@other.example", json!("relay me"))
        .await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::Refused);
}

#[tokio::test]
async fn malformed_address_fails() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    a.send("broken@", "alice@a.example", json!("nope")).await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::NoAddress);
}

/// A cached address that turns out dead is evicted, so the next attempt
/// goes back to resolution instead of retrying a stale entry.
#[tokio::test]
async fn stale_cached_address_is_evicted_on_failure() {
    let net = TestNet::new();
    let mut a = start_node(&net, "a.example", "secret-a").await;

    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    // Cached from some earlier life; not in the routing table at all.
    a.fed.ip_cache.put("gone.example", dead_addr);

    a.send("x@gone.example", "alice@a.example", json!("retry me"))
        .await;

    let (_, reason) = a.expect_failure().await;
    assert_eq!(reason, DeliveryFailure::ConnectFailed);
    assert!(
        a.fed.ip_cache.get("gone.example").is_none(),
        "dead cached address must be evicted"
    );
}

/// Promotion announces the target domain as reachable to the delivery
/// subsystem.
#[tokio::test]
async fn trusted_target_is_announced_reachable() {
    let net = TestNet::new();
    let a = start_node(&net, "a.example", "secret-a").await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    a.send("bob@b.example", "alice@a.example", json!("ping"))
        .await;
    b.expect_delivered().await;

    assert!(a
        .reachable_events()
        .contains(&("b.example".to_string(), true)));
}

/// Reachability is per target domain, not per pair: the target stays
/// announced while any pair still holds a trusted link to it, and is only
/// withdrawn when the last one closes.
#[tokio::test]
async fn target_stays_reachable_while_another_pair_holds_a_link() {
    let net = TestNet::new();
    let mut config = node_config("a1.example", "secret-a");
    config.identity.domains.push("a2.example".to_string());
    let a = start_with(&net, config, true).await;
    let mut b = start_node(&net, "b.example", "secret-b").await;

    a.send("bob@b.example", "x@a1.example", json!(1)).await;
    b.expect_delivered().await;
    a.send("bob@b.example", "x@a2.example", json!(2)).await;
    b.expect_delivered().await;

    let first = a
        .fed
        .registry
        .lock()
        .await
        .lookup(LinkTable::OutboundDialback, "a1.example/b.example")
        .expect("first pair should be trusted");
    first.close();
    for _ in 0..50 {
        if a.fed.registry.lock().await.link_counts().0 == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        !a.reachable_events()
            .contains(&("b.example".to_string(), false)),
        "target withdrawn while another pair still holds a link"
    );

    let second = a
        .fed
        .registry
        .lock()
        .await
        .lookup(LinkTable::OutboundDialback, "a2.example/b.example")
        .expect("second pair should be trusted");
    second.close();
    for _ in 0..50 {
        if a.reachable_events()
            .contains(&("b.example".to_string(), false))
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("target never announced unreachable after the last link closed");
}
