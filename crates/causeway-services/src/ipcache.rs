//! IP cache — remembers the address last used to reach a remote domain,
//! so a reconnect skips external resolution.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Clone, Default)]
pub struct IpCache {
    entries: Arc<DashMap<String, SocketAddr>>,
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<SocketAddr> {
        self.entries.get(domain).map(|e| *e.value())
    }

    /// Record the address a connection to `domain` succeeded on.
    /// Replaces (and frees) any older entry.
    pub fn put(&self, domain: &str, addr: SocketAddr) {
        self.entries.insert(domain.to_string(), addr);
    }

    pub fn remove(&self, domain: &str) {
        self.entries.remove(domain);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
