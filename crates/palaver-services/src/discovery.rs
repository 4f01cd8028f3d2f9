//! Discovery service — announce, query and withdraw peers over UDP
//! broadcast.
//!
//! One socket bound to the whois port carries all discovery traffic, and
//! one task owns it: inbound JOIN/LEAVE/WHO/KNOWNUSERS datagrams and
//! front-end commands are funneled through the same loop, so every
//! registry mutation is serialized. The registry converges last-write-
//! wins; a bad packet never takes the loop down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use palaver_core::wire::{DiscoveryMessage, DISCOVERY_BUFFER};

use crate::channel::{DiscoveryCommand, Event, EventSender};
use crate::registry::Registry;

pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    registry: Registry,
    /// Actual bound whois port — broadcasts and propagation go here.
    whois_port: u16,
    /// Address this host uses for outbound traffic, probed once at startup.
    local_addr: IpAddr,
    /// Set while the local peer is joined; own broadcast echoes match this.
    local_handle: Option<String>,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl DiscoveryService {
    /// Bind the whois socket and assemble the service. Port 0 binds an
    /// ephemeral port, reported by [`local_port`](Self::local_port).
    pub fn bind(
        whois_port: u16,
        registry: Registry,
        events: EventSender,
        commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
        shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<Self> {
        let socket = make_broadcast_socket(whois_port)?;
        let whois_port = socket.local_addr()?.port();
        let local_addr = local_outbound_addr();
        tracing::info!(port = whois_port, addr = %local_addr, "discovery service bound");
        Ok(Self {
            socket: Arc::new(socket),
            registry,
            whois_port,
            local_addr,
            local_handle: None,
            events,
            commands,
            shutdown,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.whois_port
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        let mut buf = vec![0u8; DISCOVERY_BUFFER];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery service shutting down");
                    return Ok(());
                }

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::info!("command channel closed, discovery service stopping");
                        return Ok(());
                    }
                },

                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery recv_from failed");
                        self.emit_error(format!("discovery receive failed: {e}"));
                    }
                },
            }
        }
    }

    // ── Inbound datagrams ────────────────────────────────────────────────────

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let line = match std::str::from_utf8(datagram) {
            Ok(s) => s,
            Err(_) => {
                tracing::trace!(%from, "non-UTF-8 discovery datagram dropped");
                return;
            }
        };
        let msg = match DiscoveryMessage::parse(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(%from, error = %e, "undecodable discovery datagram dropped");
                return;
            }
        };

        match msg {
            DiscoveryMessage::Join { handle, port } => self.on_join(handle, port, from).await,
            DiscoveryMessage::Leave { handle } => {
                if self.registry.apply_leave(&handle) {
                    tracing::debug!(%handle, "peer left");
                    self.notify_users();
                }
            }
            DiscoveryMessage::Who => {
                self.send_known_users(from).await;
            }
            DiscoveryMessage::KnownUsers(entries) => {
                if self.registry.apply_known_users(&entries) {
                    tracing::debug!(merged = entries.len(), "known users merged");
                    self.notify_users();
                }
            }
        }
    }

    /// A peer announced itself: record it, onboard it with everything we
    /// know, and pass the announcement on to the peers that may not have
    /// heard the broadcast. Propagation fires only on first sight of a
    /// handle — a repeat JOIN must not ricochet between peers forever.
    async fn on_join(&self, handle: String, port: u16, from: SocketAddr) {
        if self.local_handle.as_deref() == Some(handle.as_str()) && from.ip() == self.local_addr {
            tracing::trace!("ignoring own JOIN echo");
            return;
        }

        let first_sight = !self.registry.contains(&handle);
        let changed = self.registry.apply_join(&handle, from.ip(), port);
        tracing::debug!(%handle, addr = %from.ip(), port, first_sight, "peer joined");

        self.send_known_users(from).await;

        if first_sight {
            let announcement = DiscoveryMessage::Join {
                handle: handle.clone(),
                port,
            };
            for record in self.registry.records() {
                if record.handle == handle
                    || self.local_handle.as_deref() == Some(record.handle.as_str())
                {
                    continue;
                }
                self.send_to(&announcement, SocketAddr::new(record.addr, record.port))
                    .await;
            }
        }

        if changed {
            self.notify_users();
        }
    }

    // ── Front-end commands ───────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: DiscoveryCommand) {
        match cmd {
            DiscoveryCommand::Join { handle, port } => {
                let changed = self.registry.apply_join(&handle, self.local_addr, port);
                self.local_handle = Some(handle.clone());
                self.send_broadcast(&DiscoveryMessage::Join { handle, port })
                    .await;
                if changed {
                    self.notify_users();
                }
            }
            DiscoveryCommand::Who => {
                self.send_broadcast(&DiscoveryMessage::Who).await;
            }
            DiscoveryCommand::Leave { handle } => {
                let changed = self.registry.apply_leave(&handle);
                if self.local_handle.as_deref() == Some(handle.as_str()) {
                    self.local_handle = None;
                }
                let farewell = DiscoveryMessage::Leave { handle };
                self.send_broadcast(&farewell).await;
                // Best-effort direct notice for faster convergence than
                // broadcast alone.
                for record in self.registry.records() {
                    self.send_to(&farewell, SocketAddr::new(record.addr, record.port))
                        .await;
                }
                if changed {
                    self.notify_users();
                }
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    async fn send_known_users(&self, dest: SocketAddr) {
        let snapshot = DiscoveryMessage::KnownUsers(self.registry.entries());
        self.send_to(&snapshot, dest).await;
    }

    async fn send_broadcast(&self, msg: &DiscoveryMessage) {
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.whois_port);
        self.send_to(msg, dest).await;
    }

    async fn send_to(&self, msg: &DiscoveryMessage, dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(msg.encode().as_bytes(), dest).await {
            tracing::warn!(%dest, error = %e, "discovery send failed");
            self.emit_error(format!("discovery send to {dest} failed: {e}"));
        }
    }

    fn notify_users(&self) {
        let _ = self.events.send(Event::Users(self.registry.snapshot()));
    }

    fn emit_error(&self, message: String) {
        let _ = self.events.send(Event::Error(message));
    }
}

/// Create the shared whois socket: broadcast-capable, address reuse so
/// several peers can coexist on one host.
fn make_broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Learn the address this host uses for outbound traffic: connect a
/// throwaway socket toward a well-known external address and read the
/// interface the kernel picked. No bytes are sent. Falls back to
/// loopback when the host has no route at all.
fn local_outbound_addr() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
