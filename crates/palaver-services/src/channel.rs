//! Typed command/event surface between the services and the front end.
//!
//! Commands flow in over one mpsc channel per service, events flow out
//! over a shared one. No unit reads another's internal state — the front
//! end's only coordination duty is relaying the negotiated data port
//! from messaging into a discovery `Join`.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;

/// Commands accepted by the discovery service.
#[derive(Debug, Clone)]
pub enum DiscoveryCommand {
    /// Register the local peer and announce it on the whois port.
    Join { handle: String, port: u16 },
    /// Ask the network for the current peer set.
    Who,
    /// Withdraw a handle and tell every known peer.
    Leave { handle: String },
}

/// Commands accepted by the messaging service. `to` names the recipient
/// for reporting; the wire carries only the sender.
#[derive(Debug, Clone)]
pub enum MessagingCommand {
    SendText {
        from: String,
        to: String,
        text: String,
        addr: String,
        port: u16,
    },
    SendImage {
        from: String,
        to: String,
        path: PathBuf,
        addr: String,
        port: u16,
    },
}

/// Events emitted by both services toward the front end.
#[derive(Debug, Clone)]
pub enum Event {
    /// The registry changed; the full snapshot is attached.
    Users(BTreeMap<String, (IpAddr, u16)>),
    /// The messaging service bound this TCP/UDP data port.
    TcpPort(u16),
    /// A text message arrived.
    Message { sender: String, text: String },
    /// An image arrived and was written to disk.
    Image { sender: String, path: PathBuf },
    /// A recoverable failure the front end may want to surface.
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;
