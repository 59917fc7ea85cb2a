//! Periodic maintenance: close idle trusted links and fail queued packets
//! that have waited past the queue timeout.
//!
//! The sweeper only closes transports; the owning reader tasks observe
//! the closure and do their own unregistration, so there is exactly one
//! teardown path per link.

use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info};

use causeway_services::DeliveryFailure;

use crate::federation::SharedFederation;

pub async fn run(fed: SharedFederation, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(fed.sweep_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => sweep(&fed).await,
            _ = shutdown.recv() => {
                debug!("sweeper stopping");
                return;
            }
        }
    }
}

async fn sweep(fed: &SharedFederation) {
    let now = Instant::now();

    let mut idle = Vec::new();
    let pendings = {
        let reg = fed.registry.lock().await;
        reg.for_each_link(|table, key, link| {
            if link.idle_for() >= fed.idle_timeout {
                idle.push((table, key.to_string(), link.clone()));
            }
        });
        reg.each_connecting()
    };

    for (table, key, link) in idle {
        info!(
            key = %key,
            table = ?table,
            idle_secs = link.idle_for().as_secs(),
            "closing idle link"
        );
        link.close();
    }

    for pending in pendings {
        let expired = pending
            .lock()
            .await
            .take_expired(now, fed.queue_timeout);
        for qp in expired {
            fed.delivery
                .deliver_failure(qp.envelope, DeliveryFailure::Timeout);
        }
    }
}
