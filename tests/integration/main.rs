//! Palaver integration test harness.
//!
//! Tests drive real service instances over loopback sockets, with
//! scratch sockets playing the remote peers. No privileges or special
//! network setup required:
//!
//!   cargo test --test integration
//!
//! Each fixture binds ephemeral ports, so tests do not interfere with
//! each other or with anything else on the host.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};

use palaver_services::{
    DiscoveryCommand, DiscoveryService, Event, MessagingCommand, MessagingService, Registry,
};

mod messaging;

// ── Harness ───────────────────────────────────────────────────────────────────

const EVENT_DEADLINE: Duration = Duration::from_secs(5);

/// One running discovery service under test.
pub struct DiscoveryFixture {
    pub port: u16,
    pub commands: mpsc::UnboundedSender<DiscoveryCommand>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub registry: Registry,
    shutdown: broadcast::Sender<()>,
}

impl Drop for DiscoveryFixture {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Bind a discovery service on an ephemeral whois port and run it.
pub fn start_discovery() -> Result<DiscoveryFixture> {
    let registry = Registry::new();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown, _) = broadcast::channel(1);

    let service = DiscoveryService::bind(
        0,
        registry.clone(),
        event_tx,
        cmd_rx,
        shutdown.subscribe(),
    )
    .context("failed to bind discovery service")?;
    let port = service.local_port();
    tokio::spawn(service.run());

    Ok(DiscoveryFixture {
        port,
        commands: cmd_tx,
        events,
        registry,
        shutdown,
    })
}

/// One running messaging service under test.
pub struct MessagingFixture {
    pub port: u16,
    pub image_dir: std::path::PathBuf,
    pub commands: mpsc::UnboundedSender<MessagingCommand>,
    pub events: mpsc::UnboundedReceiver<Event>,
    shutdown: broadcast::Sender<()>,
}

impl Drop for MessagingFixture {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.image_dir);
    }
}

/// Bind a messaging service on a free port and run it.
pub async fn start_messaging(tag: &str) -> Result<MessagingFixture> {
    let port = free_port().await?;
    let image_dir = std::env::temp_dir().join(format!("palaver-{tag}-{}", std::process::id()));
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown, _) = broadcast::channel(1);

    let service = MessagingService::bind(
        (port, port),
        image_dir.clone(),
        event_tx,
        cmd_rx,
        shutdown.subscribe(),
    )
    .await
    .context("failed to bind messaging service")?;

    match next_event(&mut events, |e| matches!(e, Event::TcpPort(_))).await? {
        Event::TcpPort(bound) => assert_eq!(bound, port),
        _ => unreachable!(),
    }

    tokio::spawn(service.run());
    Ok(MessagingFixture {
        port,
        image_dir,
        commands: cmd_tx,
        events,
        shutdown,
    })
}

/// Find a port that is currently free for both TCP and UDP.
pub async fn free_port() -> Result<u16> {
    let tcp = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to probe for a free port")?;
    let port = tcp.local_addr()?.port();
    Ok(port)
}

/// A scratch UDP socket playing a remote peer.
pub async fn scratch_socket() -> Result<UdpSocket> {
    UdpSocket::bind("127.0.0.1:0")
        .await
        .context("failed to bind scratch socket")
}

/// Send one wire line from a scratch socket to the service under test.
pub async fn send_line(socket: &UdpSocket, line: &str, dest: SocketAddr) -> Result<()> {
    socket
        .send_to(line.as_bytes(), dest)
        .await
        .with_context(|| format!("failed to send to {dest}"))?;
    Ok(())
}

/// Receive one datagram as text, with a deadline.
pub async fn recv_line(socket: &UdpSocket) -> Result<String> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(EVENT_DEADLINE, socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for a datagram")??;
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Wait for the next event matching `pred`, discarding the rest.
pub async fn next_event<F>(
    events: &mut mpsc::UnboundedReceiver<Event>,
    mut pred: F,
) -> Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(EVENT_DEADLINE, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .context("timed out waiting for an event")?
    .context("event channel closed")
}

pub fn service_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
