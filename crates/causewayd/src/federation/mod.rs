//! Federation state shared by every handler task.

pub mod inbound;
pub mod outbound;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use causeway_core::config::CausewayConfig;
use causeway_core::keys::{random_secret, Keygen};
use causeway_services::{new_registry, DeliveryPort, IpCache, Resolver, SharedRegistry};

/// Everything the inbound/outbound handlers, dispatch, and the sweeper
/// share. The registry and the IP cache are the only cross-handler
/// mutable state; the rest is fixed at startup.
pub struct Federation {
    /// This server's own address on the federation network.
    pub server_id: String,
    /// Domains this server is authoritative for.
    pub domains: HashSet<String>,
    /// Dialback secret used to derive and verify response keys.
    pub secret: String,
    pub legacy_allowed: bool,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub queue_timeout: Duration,
    pub sweep_interval: Duration,
    pub registry: SharedRegistry,
    pub ip_cache: IpCache,
    pub keygen: Keygen,
    pub delivery: Arc<dyn DeliveryPort>,
    pub resolver: Arc<dyn Resolver>,
}

pub type SharedFederation = Arc<Federation>;

impl Federation {
    pub fn new(
        config: &CausewayConfig,
        delivery: Arc<dyn DeliveryPort>,
        resolver: Arc<dyn Resolver>,
    ) -> SharedFederation {
        let secret = if config.identity.secret.is_empty() {
            tracing::warn!(
                "no shared secret configured — generated a random one; \
                 verification only works for this process's lifetime"
            );
            random_secret()
        } else {
            config.identity.secret.clone()
        };

        Arc::new(Self {
            server_id: config.identity.server_id.clone(),
            domains: config.identity.domains.iter().cloned().collect(),
            secret,
            legacy_allowed: config.federation.legacy_allowed,
            connect_timeout: Duration::from_secs(config.network.connect_timeout_secs),
            idle_timeout: Duration::from_secs(config.federation.idle_timeout_secs),
            queue_timeout: Duration::from_secs(config.federation.queue_timeout_secs),
            sweep_interval: Duration::from_secs(config.federation.sweep_interval_secs),
            registry: new_registry(),
            ip_cache: IpCache::new(),
            keygen: Keygen::new(),
            delivery,
            resolver,
        })
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }
}
