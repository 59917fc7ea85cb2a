//! Outbound side of the federation handshake.
//!
//! The first packet for an untrusted pair creates one pending handshake;
//! everything else for that pair joins its queues. A connect task walks
//! the candidate addresses, opens a transport, claims trust, and either
//! promotes the link into the registry (flushing the packet queue in
//! arrival order) or fails every queued packet back to the delivery port.
//!
//! Lock order is always registry, then pending. Queue mutations happen
//! only under the registry lock, so a promotion never races a late
//! enqueue on the same pair.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use causeway_core::keys::dialback_key;
use causeway_core::wire::{Envelope, Frame, StreamHeader, NAMESPACE};
use causeway_services::{DeliveryFailure, DomainPair, Link, LinkTable, PendingOutbound};

use crate::federation::{inbound, SharedFederation};
use crate::net::{open_link, protocol_error, FrameReader};

/// Route one application packet toward a remote pair: straight onto a
/// trusted link, into the pending queue, or via a brand-new handshake.
pub async fn send_packet(fed: &SharedFederation, pair: DomainPair, envelope: Envelope) {
    let pending = {
        let mut reg = fed.registry.lock().await;
        let key = pair.key();
        if let Some(link) = reg
            .lookup(LinkTable::OutboundDialback, &key)
            .or_else(|| reg.lookup(LinkTable::OutboundLegacy, &key))
        {
            drop(reg);
            if !link.send(envelope.frame.clone()) {
                warn!(%pair, "trusted link writer gone, failing packet");
                fed.delivery
                    .deliver_failure(envelope, DeliveryFailure::ConnectFailed);
            }
            return;
        }
        if let Some(pending) = reg.lookup_connecting(&pair) {
            pending.lock().await.queue_packet(envelope);
            return;
        }
        let pending = Arc::new(Mutex::new(PendingOutbound::new(pair.clone())));
        pending.lock().await.queue_packet(envelope);
        reg.insert_connecting(&pair, pending.clone());
        pending
    };
    debug!(%pair, "starting outbound handshake");
    tokio::spawn(connect_task(fed.clone(), pending));
}

/// Route one verification challenge toward the claimed origin. Unlike
/// application packets these ride any open transport to the target — they
/// must not wait for trust, or two servers first contacting each other
/// would deadlock on each other's handshakes.
pub async fn send_verify(fed: &SharedFederation, pair: DomainPair, frame: Frame) {
    let pending = {
        let mut reg = fed.registry.lock().await;
        let key = pair.key();
        if let Some(link) = reg.lookup(LinkTable::OutboundDialback, &key) {
            drop(reg);
            if !link.send(frame.clone()) {
                warn!(%pair, "trusted link writer gone, failing challenge");
                synthesize_failed_verify(fed, frame).await;
            }
            return;
        }
        if reg.lookup(LinkTable::OutboundLegacy, &key).is_some() {
            // A legacy peer never answers challenges.
            drop(reg);
            synthesize_failed_verify(fed, frame).await;
            return;
        }
        if let Some(pending) = reg.lookup_connecting(&pair) {
            pending.lock().await.queue_verify(frame);
            return;
        }
        let pending = Arc::new(Mutex::new(PendingOutbound::new(pair.clone())));
        pending.lock().await.queue_verify(frame);
        reg.insert_connecting(&pair, pending.clone());
        pending
    };
    debug!(%pair, "starting outbound handshake for verification");
    tokio::spawn(connect_task(fed.clone(), pending));
}

enum Attempt {
    /// Trusted and drained; the attempt owned the rest of the stream.
    Done,
    /// This candidate address is a dead end, try the next.
    RetryNext,
    /// The remote rejected the trust claim. Terminal for the pair.
    Refused,
}

async fn connect_task(fed: SharedFederation, pending: Arc<Mutex<PendingOutbound>>) {
    let pair = pending.lock().await.pair.clone();

    let mut candidates: Vec<SocketAddr> = Vec::new();
    if let Some(addr) = fed.ip_cache.get(&pair.target) {
        candidates.push(addr);
    }
    match fed.resolver.resolve(&pair.target).await {
        Ok(addrs) => {
            for addr in addrs {
                if !candidates.contains(&addr) {
                    candidates.push(addr);
                }
            }
        }
        Err(e) => debug!(%pair, error = %e, "address resolution failed"),
    }
    if candidates.is_empty() {
        fail_pending(&fed, &pending, DeliveryFailure::NoAddress).await;
        return;
    }
    pending.lock().await.addrs = candidates.into();

    loop {
        let next = pending.lock().await.addrs.pop_front();
        let Some(addr) = next else {
            fail_pending(&fed, &pending, DeliveryFailure::ConnectFailed).await;
            return;
        };
        match attempt(&fed, &pending, &pair, addr).await {
            Attempt::Done => return,
            Attempt::RetryNext => continue,
            Attempt::Refused => {
                fail_pending(&fed, &pending, DeliveryFailure::Refused).await;
                return;
            }
        }
    }
}

/// One handshake attempt against one candidate address.
async fn attempt(
    fed: &SharedFederation,
    pending: &Arc<Mutex<PendingOutbound>>,
    pair: &DomainPair,
    addr: SocketAddr,
) -> Attempt {
    let stream = match timeout(fed.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%pair, %addr, error = %e, "connect failed");
            return Attempt::RetryNext;
        }
        Err(_) => {
            debug!(%pair, %addr, "connect timed out");
            return Attempt::RetryNext;
        }
    };
    let (link, mut reader) = open_link(stream);
    link.send(Frame::Header(StreamHeader::opening(&pair.origin)));

    let header = match timeout(fed.connect_timeout, reader.next()).await {
        Ok(Ok(Some(Frame::Header(h)))) => h,
        Ok(Ok(Some(_))) => {
            protocol_error(&link, "expected opening declaration");
            return Attempt::RetryNext;
        }
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
            link.close();
            return Attempt::RetryNext;
        }
    };
    if header.ns != NAMESPACE {
        protocol_error(&link, "unknown namespace");
        return Attempt::RetryNext;
    }
    if let Some(id) = &header.id {
        if fed.keygen.is_ours(id) {
            tracing::error!(%pair, %addr, "remote presented our own challenge id, refusing to talk to ourselves");
            link.close();
            return Attempt::RetryNext;
        }
    }

    match header.id.filter(|_| header.dialback) {
        Some(challenge) => dialback_attempt(fed, pending, pair, addr, link, reader, challenge).await,
        None => legacy_attempt(fed, pending, pair, addr, link, reader).await,
    }
}

/// Peer advertised verification: claim trust and wait for the decision.
async fn dialback_attempt(
    fed: &SharedFederation,
    pending: &Arc<Mutex<PendingOutbound>>,
    pair: &DomainPair,
    addr: SocketAddr,
    link: Link,
    mut reader: FrameReader,
    challenge: String,
) -> Attempt {
    link.send(Frame::Claim {
        to: pair.target.clone(),
        from: pair.origin.clone(),
        key: dialback_key(&fed.secret, &pair.target, &challenge),
    });

    // Expose the transport so queued and future verification challenges
    // ride it while the claim is still in flight.
    {
        let _reg = fed.registry.lock().await;
        let mut p = pending.lock().await;
        p.live = Some(link.clone());
        for v in std::mem::take(&mut p.verify_queue) {
            link.send(v);
        }
    }

    loop {
        let frame = match timeout(fed.queue_timeout, reader.next()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                clear_live(fed, pending).await;
                return Attempt::RetryNext;
            }
            Ok(Err(e)) => {
                warn!(%pair, error = %e, "handshake stream broke");
                link.close();
                clear_live(fed, pending).await;
                return Attempt::RetryNext;
            }
            Err(_) => {
                warn!(%pair, "timed out awaiting trust decision");
                link.close();
                clear_live(fed, pending).await;
                return Attempt::RetryNext;
            }
        };
        match frame {
            Frame::ClaimResult { to, from, valid } => {
                if to != pair.origin || from != pair.target {
                    protocol_error(&link, "trust decision for a different pair");
                    clear_live(fed, pending).await;
                    return Attempt::RetryNext;
                }
                if !valid {
                    warn!(%pair, "remote rejected our trust claim");
                    link.close();
                    return Attempt::Refused;
                }
                let (queued, displaced) = {
                    let mut reg = fed.registry.lock().await;
                    let displaced =
                        reg.register(LinkTable::OutboundDialback, pair.key(), link.clone());
                    let mut p = pending.lock().await;
                    p.live = None;
                    let queued = std::mem::take(&mut p.queue);
                    reg.remove_connecting(pair, pending);
                    (queued, displaced)
                };
                if let Some(old) = displaced {
                    old.close();
                }
                info!(%pair, %addr, queued = queued.len(), "outbound link trusted");
                for qp in queued {
                    link.send(qp.envelope.frame);
                }
                fed.ip_cache.put(&pair.target, addr);
                fed.delivery.register_reachable(&pair.target);
                trusted_loop(fed, pair, addr, link, reader, LinkTable::OutboundDialback).await;
                return Attempt::Done;
            }
            // Challenge answers multiplex with the handshake.
            Frame::VerifyResult {
                to,
                from,
                id,
                valid,
            } => {
                inbound::handle_verify_result(fed, &to, &from, &id, valid).await;
            }
            Frame::Error { text } => {
                warn!(%pair, error = %text, "remote aborted the handshake");
                link.close();
                clear_live(fed, pending).await;
                return Attempt::RetryNext;
            }
            other => {
                debug!(%pair, frame = ?other, "unexpected frame during handshake");
                protocol_error(&link, "unexpected frame during handshake");
                clear_live(fed, pending).await;
                return Attempt::RetryNext;
            }
        }
    }
}

/// Peer did not advertise verification: trust on connectivity alone, if
/// configuration allows it. Queued challenges can never be answered by a
/// legacy peer, so their claims fail immediately.
async fn legacy_attempt(
    fed: &SharedFederation,
    pending: &Arc<Mutex<PendingOutbound>>,
    pair: &DomainPair,
    addr: SocketAddr,
    link: Link,
    reader: FrameReader,
) -> Attempt {
    if !fed.legacy_allowed {
        warn!(%pair, %addr, "peer does not support verified trust, refusing legacy link");
        protocol_error(&link, "verified trust required");
        return Attempt::RetryNext;
    }
    let (queued, verifies, displaced) = {
        let mut reg = fed.registry.lock().await;
        let displaced = reg.register(LinkTable::OutboundLegacy, pair.key(), link.clone());
        let mut p = pending.lock().await;
        let queued = std::mem::take(&mut p.queue);
        let verifies = std::mem::take(&mut p.verify_queue);
        reg.remove_connecting(pair, pending);
        (queued, verifies, displaced)
    };
    if let Some(old) = displaced {
        old.close();
    }
    info!(%pair, %addr, queued = queued.len(), "outbound link trusted (legacy peer)");
    for qp in queued {
        link.send(qp.envelope.frame);
    }
    for v in verifies {
        synthesize_failed_verify(fed, v).await;
    }
    fed.ip_cache.put(&pair.target, addr);
    fed.delivery.register_reachable(&pair.target);
    trusted_loop(fed, pair, addr, link, reader, LinkTable::OutboundLegacy).await;
    Attempt::Done
}

/// Owns a trusted outbound stream until it closes, then tears down its
/// registry entry and reachability registration.
async fn trusted_loop(
    fed: &SharedFederation,
    pair: &DomainPair,
    addr: SocketAddr,
    link: Link,
    mut reader: FrameReader,
    table: LinkTable,
) {
    loop {
        match reader.next().await {
            Ok(Some(frame)) => {
                link.touch();
                match frame {
                    Frame::VerifyResult {
                        to,
                        from,
                        id,
                        valid,
                    } => {
                        inbound::handle_verify_result(fed, &to, &from, &id, valid).await;
                    }
                    Frame::Packet { to, from, payload } => {
                        let envelope = Envelope {
                            to: to.clone(),
                            from: from.clone(),
                            frame: Frame::Packet { to, from, payload },
                        };
                        fed.delivery.deliver(envelope);
                    }
                    Frame::Error { text } => {
                        warn!(%pair, error = %text, "remote closed outbound link with an error");
                        break;
                    }
                    other => {
                        debug!(%pair, frame = ?other, "ignoring unexpected frame on trusted outbound link");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%pair, error = %e, "outbound link read failed");
                break;
            }
        }
    }
    link.close();
    // Another pair can still hold a trusted link to the same target; only
    // the last one down withdraws reachability.
    let target_gone = {
        let mut reg = fed.registry.lock().await;
        reg.unregister(table, &pair.key(), link.serial());
        !reg.has_outbound_to(&pair.target)
    };
    if target_gone {
        fed.delivery.unregister_reachable(&pair.target);
    }
    // Remember the last working address for the next handshake.
    fed.ip_cache.put(&pair.target, addr);
    info!(
        %pair,
        packets = link.packets(),
        age_secs = link.age().as_secs(),
        "outbound link closed"
    );
}

/// Terminal failure: drop the pending entry, fail every queued packet,
/// and answer every queued challenge with an invalid result so the
/// inbound side can reject the matching claims.
async fn fail_pending(
    fed: &SharedFederation,
    pending: &Arc<Mutex<PendingOutbound>>,
    reason: DeliveryFailure,
) {
    let (pair, queued, verifies, live) = {
        let mut reg = fed.registry.lock().await;
        let mut p = pending.lock().await;
        reg.remove_connecting(&p.pair, pending);
        (
            p.pair.clone(),
            std::mem::take(&mut p.queue),
            std::mem::take(&mut p.verify_queue),
            p.live.take(),
        )
    };
    if let Some(link) = live {
        link.close();
    }
    // A cached address that could not be reached is stale.
    if matches!(
        reason,
        DeliveryFailure::NoAddress | DeliveryFailure::ConnectFailed
    ) {
        fed.ip_cache.remove(&pair.target);
    }
    warn!(%pair, %reason, failed = queued.len(), "outbound handshake failed");
    for qp in queued {
        fed.delivery.deliver_failure(qp.envelope, reason);
    }
    for v in verifies {
        synthesize_failed_verify(fed, v).await;
    }
}

/// Resolve a challenge that can never reach the claimed origin as if the
/// origin had answered "invalid".
async fn synthesize_failed_verify(fed: &SharedFederation, frame: Frame) {
    if let Frame::Verify { to, from, id, .. } = frame {
        inbound::handle_verify_result(fed, &from, &to, &id, false).await;
    }
}

async fn clear_live(fed: &SharedFederation, pending: &Arc<Mutex<PendingOutbound>>) {
    let _reg = fed.registry.lock().await;
    pending.lock().await.live = None;
}
