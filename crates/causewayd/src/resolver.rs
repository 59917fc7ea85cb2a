//! System DNS resolver behind the narrow lookup port.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;

use causeway_services::Resolver;

/// Resolves remote domains through the operating system, trying the
/// configured federation port on every returned address.
pub struct DnsResolver {
    port: u16,
}

impl DnsResolver {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain, self.port))
            .await
            .with_context(|| format!("failed to resolve {domain}"))?
            .collect();
        Ok(addrs)
    }
}
