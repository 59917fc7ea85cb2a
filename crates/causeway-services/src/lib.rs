//! causeway-services — shared federation state: the connection registry,
//! link wrappers, pending-connection bookkeeping, the IP cache, and the
//! narrow ports to external collaborators.

pub mod ipcache;
pub mod link;
pub mod pending;
pub mod ports;
pub mod registry;

pub use ipcache::IpCache;
pub use link::{Link, LinkCmd};
pub use pending::{ClaimKey, InboundContext, PendingOutbound, QueuedPacket};
pub use ports::{DeliveryFailure, DeliveryPort, Resolver};
pub use registry::{new_registry, DomainPair, LinkTable, Registry, SharedRegistry};
