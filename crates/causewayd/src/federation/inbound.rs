//! Inbound side of the federation handshake.
//!
//! Every accepted transport gets its own serve task. A peer that
//! advertises verification gets a challenge id and may multiplex any
//! number of trust claims on the stream; each verified pair registers its
//! own inbound table entry. A peer that does not advertise verification
//! is either rejected outright or trusted on connectivity alone,
//! depending on configuration.
//!
//! Invalid traffic is handled asymmetrically on purpose: a failed claim
//! only earns an invalid decision (the stream survives, other claims on
//! it may still succeed), while an unverified or malformed packet kills
//! the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use causeway_core::keys::dialback_key;
use causeway_core::wire::{domain_of, Envelope, Frame, StreamHeader, NAMESPACE};
use causeway_services::{ClaimKey, DomainPair, InboundContext, Link, LinkTable};

use crate::dispatch;
use crate::federation::SharedFederation;
use crate::net::{open_link, protocol_error, FrameReader};

/// Own one accepted transport from the opening declaration to teardown.
pub async fn serve(fed: SharedFederation, stream: TcpStream, peer: SocketAddr) {
    let (link, mut reader) = open_link(stream);

    let header = match timeout(fed.connect_timeout, reader.next()).await {
        Ok(Ok(Some(Frame::Header(h)))) => h,
        Ok(Ok(Some(_))) => {
            protocol_error(&link, "expected opening declaration");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "malformed opening declaration");
            protocol_error(&link, "malformed opening declaration");
            return;
        }
        Err(_) => {
            debug!(%peer, "no opening declaration before timeout");
            link.close();
            return;
        }
    };
    if header.ns != NAMESPACE {
        protocol_error(&link, "unknown namespace");
        return;
    }

    if !header.dialback {
        serve_legacy(&fed, link, reader, peer, header).await;
        return;
    }

    // Hand out the challenge id; it correlates every claim on this stream.
    let sid = fed.keygen.random_challenge();
    link.send(Frame::Header(StreamHeader::accepting(
        true,
        Some(sid.clone()),
    )));
    let ctx = Arc::new(InboundContext::new(sid.clone(), link.clone()));
    fed.registry.lock().await.insert_awaiting_verify(ctx.clone());
    info!(%peer, id = %sid, origin = ?header.from, "inbound stream opened");

    dialback_loop(&fed, &ctx, &mut reader).await;

    // Teardown: the stream closing withdraws every trust it earned.
    let pairs = ctx.verified_pairs();
    {
        let mut reg = fed.registry.lock().await;
        reg.remove_awaiting_verify(&sid);
        for pair in &pairs {
            reg.unregister(
                LinkTable::InboundDialback,
                &pair.inbound_key(&sid),
                link.serial(),
            );
        }
    }
    fed.keygen.forget(&sid);
    link.close();
    info!(
        %peer,
        id = %sid,
        verified = pairs.len(),
        packets = link.packets(),
        age_secs = link.age().as_secs(),
        "inbound stream closed"
    );
}

async fn dialback_loop(
    fed: &SharedFederation,
    ctx: &Arc<InboundContext>,
    reader: &mut FrameReader,
) {
    loop {
        let frame = match reader.next().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(id = %ctx.stream_id, error = %e, "inbound stream read failed");
                protocol_error(&ctx.link, "malformed frame");
                return;
            }
        };
        ctx.link.touch();
        match frame {
            Frame::Verify { to, from, id, key } => {
                // We are the claimed origin: check whether the presented
                // response is the one we would have derived, and answer on
                // this same stream.
                let valid =
                    fed.is_local_domain(&to) && key == dialback_key(&fed.secret, &from, &id);
                debug!(origin = %to, target = %from, valid, "answered verification challenge");
                ctx.link.send(Frame::VerifyResult {
                    to: from,
                    from: to,
                    id,
                    valid,
                });
            }
            Frame::Claim { to, from, key } => {
                handle_claim(fed, ctx, to, from, key).await;
            }
            Frame::Packet { to, from, payload } => {
                let pair = match (domain_of(&from), domain_of(&to)) {
                    (Some(origin), Some(target)) => DomainPair::new(origin, target),
                    _ => {
                        protocol_error(&ctx.link, "malformed packet address");
                        return;
                    }
                };
                if !ctx.is_verified(&pair) {
                    warn!(id = %ctx.stream_id, %pair, "packet from an unverified pair");
                    protocol_error(&ctx.link, "pair not verified on this stream");
                    return;
                }
                let envelope = Envelope {
                    to: to.clone(),
                    from: from.clone(),
                    frame: Frame::Packet { to, from, payload },
                };
                fed.delivery.deliver(envelope);
            }
            Frame::Error { text } => {
                debug!(id = %ctx.stream_id, error = %text, "remote closed inbound stream with an error");
                return;
            }
            other => {
                debug!(id = %ctx.stream_id, frame = ?other, "unexpected frame on inbound stream");
                protocol_error(&ctx.link, "unexpected frame");
                return;
            }
        }
    }
}

/// A trust claim: relay the presented response to the claimed origin's
/// own address and hold the claim until the answer comes back. A claim
/// for a domain we do not host is rejected in place; the stream survives.
async fn handle_claim(
    fed: &SharedFederation,
    ctx: &Arc<InboundContext>,
    to: String,
    from: String,
    key: String,
) {
    if !fed.is_local_domain(&to) || domain_of(&from) != Some(from.as_str()) {
        warn!(id = %ctx.stream_id, origin = %from, target = %to, "rejecting claim for an unserved pair");
        ctx.link.send(Frame::ClaimResult {
            to: from,
            from: to,
            valid: false,
        });
        return;
    }
    debug!(id = %ctx.stream_id, origin = %from, target = %to, "relaying trust claim for verification");
    ctx.record_claim(
        ClaimKey {
            id: ctx.stream_id.clone(),
            origin: from.clone(),
            target: to.clone(),
        },
        key.clone(),
    );
    // The challenge travels under our own id so dispatch recognizes it
    // and routes it to the origin's own address, never back along the
    // stream the claim arrived on.
    let envelope = Envelope {
        to: from.clone(),
        from: fed.server_id.clone(),
        frame: Frame::Verify {
            to: from,
            from: to,
            id: ctx.stream_id.clone(),
            key,
        },
    };
    dispatch::route(fed, envelope).await;
}

/// The answer to a relayed challenge, from wherever it arrived: match it
/// to the pending claim, promote the pair on a valid answer, and send the
/// final decision down the claimant's stream either way.
pub async fn handle_verify_result(
    fed: &SharedFederation,
    to: &str,
    from: &str,
    id: &str,
    valid: bool,
) {
    let ctx = { fed.registry.lock().await.lookup_awaiting_verify(id) };
    let Some(ctx) = ctx else {
        debug!(id, "verification result for an unknown stream");
        return;
    };
    let claim = ClaimKey {
        id: id.to_string(),
        origin: from.to_string(),
        target: to.to_string(),
    };
    if ctx.take_claim(&claim).is_none() {
        debug!(id, origin = from, target = to, "verification result without a pending claim");
        return;
    }
    let pair = DomainPair::new(from, to);
    if valid {
        ctx.mark_verified(pair.clone());
        let displaced = {
            let mut reg = fed.registry.lock().await;
            reg.register(
                LinkTable::InboundDialback,
                pair.inbound_key(id),
                ctx.link.clone(),
            )
        };
        if let Some(old) = displaced {
            if old.serial() != ctx.link.serial() {
                old.close();
            }
        }
        info!(%pair, id, "inbound pair verified");
    } else {
        warn!(%pair, id, "verification failed, rejecting claim");
    }
    ctx.link.send(Frame::ClaimResult {
        to: from.to_string(),
        from: to.to_string(),
        valid,
    });
}

/// A peer that never advertised verification. When configuration allows
/// it the stream is trusted on connectivity alone and filed under its own
/// synthesized key; its packets are delivered without pair checks.
async fn serve_legacy(
    fed: &SharedFederation,
    link: Link,
    mut reader: FrameReader,
    peer: SocketAddr,
    header: StreamHeader,
) {
    if !fed.legacy_allowed {
        warn!(%peer, origin = ?header.from, "rejecting legacy peer, verified trust required");
        protocol_error(&link, "verified trust required");
        return;
    }
    link.send(Frame::Header(StreamHeader::accepting(false, None)));

    let key = format!("{}#{}", header.from.as_deref().unwrap_or("unknown"), link.serial());
    {
        let mut reg = fed.registry.lock().await;
        reg.register(LinkTable::InboundLegacy, key.clone(), link.clone());
    }
    info!(%peer, key = %key, "inbound stream trusted (legacy peer)");

    loop {
        match reader.next().await {
            Ok(Some(frame)) => {
                link.touch();
                match frame {
                    Frame::Packet { to, from, payload } => {
                        let envelope = Envelope {
                            to: to.clone(),
                            from: from.clone(),
                            frame: Frame::Packet { to, from, payload },
                        };
                        fed.delivery.deliver(envelope);
                    }
                    Frame::Error { text } => {
                        debug!(%peer, error = %text, "legacy peer closed with an error");
                        break;
                    }
                    other => {
                        debug!(%peer, frame = ?other, "unexpected frame on legacy stream");
                        protocol_error(&link, "unexpected frame");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, error = %e, "legacy stream read failed");
                protocol_error(&link, "malformed frame");
                break;
            }
        }
    }
    link.close();
    {
        let mut reg = fed.registry.lock().await;
        reg.unregister(LinkTable::InboundLegacy, &key, link.serial());
    }
    info!(
        %peer,
        packets = link.packets(),
        age_secs = link.age().as_secs(),
        "legacy inbound stream closed"
    );
}
