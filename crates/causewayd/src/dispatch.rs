//! Routing of locally originated envelopes onto federation links.
//!
//! Everything the delivery subsystem (or the inbound handler, for
//! challenge relays) wants sent to another server enters here. Dispatch
//! decides between the loopback path, the verification fast path, and
//! the ordinary per-pair outbound path.

use causeway_core::wire::{domain_of, Envelope, Frame};
use causeway_services::{DeliveryFailure, DomainPair};
use tracing::{debug, warn};

use crate::federation::{outbound, SharedFederation};

/// Route one envelope. Never blocks on the network; anything that needs
/// a handshake is queued and handled by the connect task.
pub async fn route(fed: &SharedFederation, envelope: Envelope) {
    // Challenge relays travel under the server's own id. They carry the
    // real pair inside the frame and must reach the claimed origin's own
    // address, independent of any claim stream.
    if envelope.from == fed.server_id {
        if let Frame::Verify { ref to, ref from, .. } = envelope.frame {
            let pair = DomainPair::new(from.clone(), to.clone());
            outbound::send_verify(fed, pair, envelope.frame).await;
            return;
        }
    }

    let pair = match (domain_of(&envelope.from), domain_of(&envelope.to)) {
        (Some(origin), Some(target)) => DomainPair::new(origin, target),
        _ => {
            warn!(to = %envelope.to, from = %envelope.from, "dropping envelope with malformed address");
            fed.delivery
                .deliver_failure(envelope, DeliveryFailure::NoAddress);
            return;
        }
    };

    if fed.is_local_domain(&pair.target) {
        debug!(%pair, "local destination, looping back");
        fed.delivery.deliver(envelope);
        return;
    }
    if !fed.is_local_domain(&pair.origin) {
        warn!(%pair, "refusing to relay for a non-local origin");
        fed.delivery
            .deliver_failure(envelope, DeliveryFailure::Refused);
        return;
    }

    outbound::send_packet(fed, pair, envelope).await;
}
