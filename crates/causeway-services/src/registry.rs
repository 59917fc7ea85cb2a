//! Connection registry — the keyed tables every handler consults.
//!
//! One `Registry` value owns every table, and all mutation goes through a
//! single `Mutex`, so the cross-table invariants (one pending handshake
//! per pair, one trusted link per pair per flavor) hold without races.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::link::Link;
use crate::pending::{InboundContext, PendingOutbound};

// ── Keys ──────────────────────────────────────────────────────────────────────

/// The ordered (origin, target) address combination trust is established
/// for — the unit of trust.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainPair {
    pub origin: String,
    pub target: String,
}

impl DomainPair {
    pub fn new(origin: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            target: target.into(),
        }
    }

    /// Canonical string form, used as the registry key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.origin, self.target)
    }

    /// Inbound entries carry the stream correlation id as an extra key
    /// component, so the same pair verified on two streams never collides.
    pub fn inbound_key(&self, stream_id: &str) -> String {
        format!("{}/{}#{}", self.origin, self.target, stream_id)
    }
}

impl std::fmt::Display for DomainPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.origin, self.target)
    }
}

/// Which trusted-link table an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTable {
    /// Fully trusted outbound, dialback flavor. Keyed by pair.
    OutboundDialback,
    /// Fully trusted outbound, legacy flavor. Keyed by pair.
    OutboundLegacy,
    /// Fully trusted inbound, keyed by pair + stream correlation id.
    InboundDialback,
    /// Legacy inbound, keyed by a locally synthesized identifier.
    InboundLegacy,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Shared registry handle.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Create a new empty shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Mutex::new(Registry::new()))
}

#[derive(Default)]
pub struct Registry {
    out_dialback: HashMap<String, Link>,
    out_legacy: HashMap<String, Link>,
    in_dialback: HashMap<String, Link>,
    in_legacy: HashMap<String, Link>,
    /// Outbound handshakes mid-flight, keyed by pair.
    connecting: HashMap<String, Arc<Mutex<PendingOutbound>>>,
    /// Inbound streams awaiting verification, keyed by correlation id.
    awaiting_verify: HashMap<String, Arc<InboundContext>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: LinkTable) -> &HashMap<String, Link> {
        match table {
            LinkTable::OutboundDialback => &self.out_dialback,
            LinkTable::OutboundLegacy => &self.out_legacy,
            LinkTable::InboundDialback => &self.in_dialback,
            LinkTable::InboundLegacy => &self.in_legacy,
        }
    }

    fn table_mut(&mut self, table: LinkTable) -> &mut HashMap<String, Link> {
        match table {
            LinkTable::OutboundDialback => &mut self.out_dialback,
            LinkTable::OutboundLegacy => &mut self.out_legacy,
            LinkTable::InboundDialback => &mut self.in_dialback,
            LinkTable::InboundLegacy => &mut self.in_legacy,
        }
    }

    /// File a trusted link under a key. Returns the displaced occupant,
    /// if any, so the caller can close it — at most one live link per key.
    pub fn register(&mut self, table: LinkTable, key: String, link: Link) -> Option<Link> {
        self.table_mut(table).insert(key, link)
    }

    pub fn lookup(&self, table: LinkTable, key: &str) -> Option<Link> {
        self.table(table).get(key).cloned()
    }

    /// Remove an entry, but only if the occupant is the link with the
    /// given serial. Idempotent: a no-op when the key is absent or held
    /// by a replacement, tolerating races between replacement and async
    /// cleanup.
    pub fn unregister(&mut self, table: LinkTable, key: &str, serial: u64) -> bool {
        let map = self.table_mut(table);
        if map.get(key).is_some_and(|l| l.serial() == serial) {
            map.remove(key);
            true
        } else {
            false
        }
    }

    pub fn for_each(&self, table: LinkTable, mut f: impl FnMut(&str, &Link)) {
        for (key, link) in self.table(table) {
            f(key, link);
        }
    }

    /// Visit every trusted link in every table (the sweeper's view).
    pub fn for_each_link(&self, mut f: impl FnMut(LinkTable, &str, &Link)) {
        for table in [
            LinkTable::OutboundDialback,
            LinkTable::OutboundLegacy,
            LinkTable::InboundDialback,
            LinkTable::InboundLegacy,
        ] {
            for (key, link) in self.table(table) {
                f(table, key, link);
            }
        }
    }

    /// Is any trusted outbound link, of either flavor, still filed for
    /// this target domain? Teardown withdraws reachability only when the
    /// last one goes.
    pub fn has_outbound_to(&self, target: &str) -> bool {
        self.out_dialback
            .keys()
            .chain(self.out_legacy.keys())
            .any(|key| key.rsplit_once('/').is_some_and(|(_, t)| t == target))
    }

    pub fn link_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.out_dialback.len(),
            self.out_legacy.len(),
            self.in_dialback.len(),
            self.in_legacy.len(),
        )
    }

    // ── Connecting table ─────────────────────────────────────────────────────

    pub fn lookup_connecting(&self, pair: &DomainPair) -> Option<Arc<Mutex<PendingOutbound>>> {
        self.connecting.get(&pair.key()).cloned()
    }

    /// Insert a pending handshake. Callers check-then-insert while holding
    /// the registry lock, preserving the one-pending-per-pair invariant.
    pub fn insert_connecting(&mut self, pair: &DomainPair, pending: Arc<Mutex<PendingOutbound>>) {
        self.connecting.insert(pair.key(), pending);
    }

    /// Remove a pending handshake, but only the given one — a no-op if a
    /// later handshake already replaced it.
    pub fn remove_connecting(
        &mut self,
        pair: &DomainPair,
        pending: &Arc<Mutex<PendingOutbound>>,
    ) -> bool {
        let key = pair.key();
        if self
            .connecting
            .get(&key)
            .is_some_and(|p| Arc::ptr_eq(p, pending))
        {
            self.connecting.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn connecting_len(&self) -> usize {
        self.connecting.len()
    }

    pub fn each_connecting(&self) -> Vec<Arc<Mutex<PendingOutbound>>> {
        self.connecting.values().cloned().collect()
    }

    // ── Awaiting-verify table ────────────────────────────────────────────────

    pub fn insert_awaiting_verify(&mut self, ctx: Arc<InboundContext>) {
        self.awaiting_verify.insert(ctx.stream_id.clone(), ctx);
    }

    pub fn lookup_awaiting_verify(&self, stream_id: &str) -> Option<Arc<InboundContext>> {
        self.awaiting_verify.get(stream_id).cloned()
    }

    pub fn remove_awaiting_verify(&mut self, stream_id: &str) -> Option<Arc<InboundContext>> {
        self.awaiting_verify.remove(stream_id)
    }
}
