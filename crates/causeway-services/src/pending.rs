//! Not-yet-trusted connection state: the pending outbound handshake with
//! its packet/verification queues, and the pending inbound verification
//! context with its claim set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use causeway_core::wire::{Envelope, Frame};

use crate::link::Link;
use crate::registry::DomainPair;

// ── Outbound ──────────────────────────────────────────────────────────────────

/// One application packet waiting for its destination's handshake,
/// stamped with the time it entered the queue.
#[derive(Debug)]
pub struct QueuedPacket {
    pub envelope: Envelope,
    pub queued_at: Instant,
}

/// An in-flight outbound handshake for one domain pair.
///
/// Lives in the registry's connecting table from the first packet for an
/// untrusted pair until the handshake succeeds (queues flushed to the new
/// link) or finally fails (queues failed back / synthesized). At most one
/// exists per pair: a second packet joins the queue, never a second
/// handshake.
pub struct PendingOutbound {
    pub pair: DomainPair,
    /// Candidate addresses still untried.
    pub addrs: VecDeque<SocketAddr>,
    pub created_at: Instant,
    /// FIFO queue of packets awaiting trust.
    pub queue: Vec<QueuedPacket>,
    /// FIFO queue of verification requests. These flush as soon as any
    /// transport to the target exists — they do not wait for trust.
    pub verify_queue: Vec<Frame>,
    /// The handshake transport, once one is open.
    pub live: Option<Link>,
}

impl PendingOutbound {
    pub fn new(pair: DomainPair) -> Self {
        Self {
            pair,
            addrs: VecDeque::new(),
            created_at: Instant::now(),
            queue: Vec::new(),
            verify_queue: Vec::new(),
            live: None,
        }
    }

    pub fn queue_packet(&mut self, envelope: Envelope) {
        self.queue.push(QueuedPacket {
            envelope,
            queued_at: Instant::now(),
        });
    }

    /// Queue a verification request, or send it right away when a
    /// handshake transport is already open.
    pub fn queue_verify(&mut self, frame: Frame) {
        match &self.live {
            Some(link) => {
                link.send(frame);
            }
            None => self.verify_queue.push(frame),
        }
    }

    /// The sweep predicate: a packet exactly at the boundary is failed.
    pub fn expired(queued_at: Instant, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(queued_at) >= timeout
    }

    /// Remove and return queued packets at or past the timeout, leaving
    /// younger packets (and this pending connection itself) untouched.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<QueuedPacket> {
        let mut expired = Vec::new();
        self.queue.retain_mut(|p| {
            if Self::expired(p.queued_at, now, timeout) {
                expired.push(QueuedPacket {
                    envelope: p.envelope.clone(),
                    queued_at: p.queued_at,
                });
                false
            } else {
                true
            }
        });
        expired
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Synthetic key for one trust claim awaiting its verification result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    /// Correlation id of the inbound stream the claim arrived on.
    pub id: String,
    /// Claimed origin domain.
    pub origin: String,
    /// Local target domain the claim was made to.
    pub target: String,
}

/// One not-yet-authenticated inbound stream that has advertised dialback.
///
/// Several claims can be in flight on one stream; each verified pair
/// registers its own inbound table entry. Destroyed when the stream
/// closes, which removes it from the awaiting-verify table.
pub struct InboundContext {
    /// Locally generated correlation id, also the challenge nonce for
    /// every claim made on this stream.
    pub stream_id: String,
    /// Writer handle for the inbound stream.
    pub link: Link,
    claims: Mutex<HashMap<ClaimKey, String>>,
    verified: Mutex<HashSet<DomainPair>>,
}

impl InboundContext {
    pub fn new(stream_id: String, link: Link) -> Self {
        Self {
            stream_id,
            link,
            claims: Mutex::new(HashMap::new()),
            verified: Mutex::new(HashSet::new()),
        }
    }

    /// Record a claim's presented response value until the verification
    /// round trip resolves it.
    pub fn record_claim(&self, key: ClaimKey, response: String) {
        self.claims
            .lock()
            .expect("claims mutex poisoned")
            .insert(key, response);
    }

    /// Match a verification result against the pending-claims set.
    /// Returns the presented response value if the claim was pending.
    pub fn take_claim(&self, key: &ClaimKey) -> Option<String> {
        self.claims
            .lock()
            .expect("claims mutex poisoned")
            .remove(key)
    }

    pub fn mark_verified(&self, pair: DomainPair) {
        self.verified
            .lock()
            .expect("verified mutex poisoned")
            .insert(pair);
    }

    pub fn is_verified(&self, pair: &DomainPair) -> bool {
        self.verified
            .lock()
            .expect("verified mutex poisoned")
            .contains(pair)
    }

    /// Pairs promoted on this stream, for teardown of their table entries.
    pub fn verified_pairs(&self) -> Vec<DomainPair> {
        self.verified
            .lock()
            .expect("verified mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
