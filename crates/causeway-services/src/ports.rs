//! Ports to external collaborators: the packet-delivery subsystem and the
//! address-resolution service. This core only ever sees these narrow
//! interfaces; the daemon and the tests plug in their own implementations.

use std::net::SocketAddr;

use async_trait::async_trait;

use causeway_core::wire::Envelope;

/// Why a packet could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// No address for the destination domain could be obtained.
    NoAddress,
    /// Every candidate address refused or dropped the connection.
    ConnectFailed,
    /// The packet waited in the outbound queue past the configured limit.
    Timeout,
    /// The remote rejected our trust claim, or the packet named a domain
    /// this server cannot claim for.
    Refused,
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAddress => write!(f, "destination unresolvable"),
            Self::ConnectFailed => write!(f, "connection refused by all candidates"),
            Self::Timeout => write!(f, "timed out in outbound queue"),
            Self::Refused => write!(f, "trust refused"),
        }
    }
}

/// The external delivery subsystem. `deliver` receives trusted inbound
/// application data; `deliver_failure` receives every packet this core
/// could not send. The reachability calls feed the resolver-bypass layer.
pub trait DeliveryPort: Send + Sync {
    fn deliver(&self, envelope: Envelope);
    fn deliver_failure(&self, envelope: Envelope, reason: DeliveryFailure);
    fn register_reachable(&self, domain: &str);
    fn unregister_reachable(&self, domain: &str);
}

/// External address resolution. An empty candidate list (or an error) is
/// terminal for a handshake attempt.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> anyhow::Result<Vec<SocketAddr>>;
}
