//! palaverd — serverless LAN chat daemon.
//!
//! Thin shell around the two services: messaging negotiates the data
//! port, the daemon relays it into a discovery JOIN, and every event is
//! logged for whatever front end is attached. All protocol logic lives
//! in palaver-services.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use palaver_core::config::Config;
use palaver_services::{
    DiscoveryCommand, DiscoveryService, Event, MessagingService, Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(Path::new(&path))
            .with_context(|| format!("failed to load config {path}"))?,
        None => {
            if let Err(e) = Config::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            Config::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                Config::default()
            })
        }
    };
    tracing::info!(
        handle = %config.handle,
        whois_port = config.whois_port,
        "palaverd starting"
    );

    let registry = Registry::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let (disc_tx, disc_rx) = mpsc::unbounded_channel();
    let (_msg_tx, msg_rx) = mpsc::unbounded_channel();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn services ───────────────────────────────────────────────────────

    let messaging = MessagingService::bind(
        config.port_range,
        config.image_dir.clone(),
        event_tx.clone(),
        msg_rx,
        shutdown_tx.subscribe(),
    )
    .await
    .context("messaging service failed to start")?;
    let data_port = messaging.port();

    let discovery = DiscoveryService::bind(
        config.whois_port,
        registry,
        event_tx.clone(),
        disc_rx,
        shutdown_tx.subscribe(),
    )
    .context("discovery service failed to start")?;

    let messaging_task = tokio::spawn(messaging.run());
    let discovery_task = tokio::spawn(discovery.run());

    // The front end's one coordination duty: join under the negotiated port.
    disc_tx
        .send(DiscoveryCommand::Join {
            handle: config.handle.clone(),
            port: data_port,
        })
        .ok();

    // ── Event pump ───────────────────────────────────────────────────────────

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Users(users) => {
                    tracing::info!(count = users.len(), ?users, "peer list updated")
                }
                Event::TcpPort(port) => tracing::info!(port, "data port negotiated"),
                Event::Message { sender, text } => {
                    tracing::info!(%sender, %text, "message received")
                }
                Event::Image { sender, path } => {
                    tracing::info!(%sender, path = %path.display(), "image received")
                }
                Event::Error(message) => tracing::warn!(%message, "service error"),
            }
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = messaging_task     => tracing::error!("messaging service exited: {:?}", r),
        r = discovery_task     => tracing::error!("discovery service exited: {:?}", r),
        r = event_task         => tracing::error!("event pump exited: {:?}", r),
    }

    Ok(())
}
