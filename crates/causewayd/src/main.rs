//! causewayd — Causeway server-to-server federation daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use causeway_core::config::CausewayConfig;
use causeway_core::wire::Envelope;
use causeway_services::{DeliveryFailure, DeliveryPort};

use causewayd::federation::{inbound, Federation};
use causewayd::resolver::DnsResolver;
use causewayd::sweeper;

/// Stand-in delivery subsystem: logs everything the federation core hands
/// back. A deployment replaces this with its router process.
struct LogDelivery;

impl DeliveryPort for LogDelivery {
    fn deliver(&self, envelope: Envelope) {
        tracing::info!(to = %envelope.to, from = %envelope.from, "packet delivered");
    }

    fn deliver_failure(&self, envelope: Envelope, reason: DeliveryFailure) {
        tracing::warn!(to = %envelope.to, from = %envelope.from, %reason, "packet failed");
    }

    fn register_reachable(&self, domain: &str) {
        tracing::info!(domain, "domain reachable");
    }

    fn unregister_reachable(&self, domain: &str) {
        tracing::info!(domain, "domain unreachable");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CausewayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CausewayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CausewayConfig::default()
    });
    tracing::info!(
        server_id = %config.identity.server_id,
        domains = ?config.identity.domains,
        legacy_allowed = config.federation.legacy_allowed,
        "causewayd starting"
    );

    let resolver = Arc::new(DnsResolver::new(config.network.port));
    let fed = Federation::new(&config, Arc::new(LogDelivery), resolver);

    // Bind the federation listener
    let listen: SocketAddr = format!("{}:{}", config.network.listen_addr, config.network.port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(addr = %listen, "listening for federation streams");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let accept_task = {
        let fed = fed.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(inbound::serve(fed.clone(), stream, peer));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    let sweeper_task = tokio::spawn(sweeper::run(fed.clone(), shutdown_tx.subscribe()));

    let snapshot_printer = {
        let fed = fed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let reg = fed.registry.lock().await;
                let (out_db, out_legacy, in_db, in_legacy) = reg.link_counts();
                tracing::info!(
                    out_db,
                    out_legacy,
                    in_db,
                    in_legacy,
                    connecting = reg.connecting_len(),
                    "link table snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = accept_task       => tracing::error!("accept loop exited: {:?}", r),
        r = sweeper_task      => tracing::error!("sweeper exited: {:?}", r),
        r = snapshot_printer  => tracing::error!("snapshot printer exited: {:?}", r),
    }

    // Close every live link so peers see clean stream ends.
    {
        let reg = fed.registry.lock().await;
        reg.for_each_link(|_, _, link| link.close());
    }

    Ok(())
}
