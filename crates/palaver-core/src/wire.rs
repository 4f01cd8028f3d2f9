//! Palaver wire format — the on-wire grammar for all traffic.
//!
//! Every message is one newline-terminated ASCII line: a command word
//! followed by space-separated fields. Discovery lines travel as UDP
//! datagrams on the shared whois port; `MSG` lines travel over TCP on a
//! peer's data port; an `IMG` line opens a UDP datagram and is followed
//! by raw payload bytes in the same and subsequent datagrams.
//!
//! Changing anything here is a breaking change for every peer on the
//! link — all participants must speak the same grammar.

use std::net::IpAddr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum text message length in characters. Longer texts are rejected
/// locally and never reach the network.
pub const MAX_TEXT_LEN: usize = 512;

/// Fixed payload chunk size for image transfer over UDP. A header plus one
/// chunk stays below the 65,507-byte datagram limit.
pub const IMAGE_CHUNK_SIZE: usize = 60_000;

/// Receive buffer size for discovery datagrams.
pub const DISCOVERY_BUFFER: usize = 1024;

/// Receive buffer size for data-port datagrams — one full chunk plus header.
pub const DATA_BUFFER: usize = 65_535;

// ── Discovery messages ────────────────────────────────────────────────────────

/// One `<handle> <ip> <port>` triple inside a `KNOWNUSERS` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub handle: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// A message on the shared whois port.
///
/// `JOIN` and `LEAVE` announce a peer; `WHO` asks for the current peer
/// set; `KNOWNUSERS` carries a full registry snapshot. A `JOIN` names no
/// address — receivers take it from the datagram source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Join { handle: String, port: u16 },
    Leave { handle: String },
    Who,
    KnownUsers(Vec<PeerInfo>),
}

impl DiscoveryMessage {
    /// Parse one discovery line. Trailing newline is tolerated.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(WireError::Empty);
        }
        let (word, rest) = match line.split_once(' ') {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        match word {
            "JOIN" => {
                let mut fields = rest.split_whitespace();
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(handle), Some(port), None) => Ok(Self::Join {
                        handle: handle.to_string(),
                        port: parse_port(port)?,
                    }),
                    _ => Err(WireError::Malformed("JOIN")),
                }
            }
            "LEAVE" => {
                let mut fields = rest.split_whitespace();
                match (fields.next(), fields.next()) {
                    (Some(handle), None) => Ok(Self::Leave {
                        handle: handle.to_string(),
                    }),
                    _ => Err(WireError::Malformed("LEAVE")),
                }
            }
            "WHO" => {
                if rest.is_empty() {
                    Ok(Self::Who)
                } else {
                    Err(WireError::Malformed("WHO"))
                }
            }
            "KNOWNUSERS" => {
                let mut entries = Vec::new();
                for entry in rest.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    let mut fields = entry.split_whitespace();
                    match (fields.next(), fields.next(), fields.next(), fields.next()) {
                        (Some(handle), Some(addr), Some(port), None) => entries.push(PeerInfo {
                            handle: handle.to_string(),
                            addr: addr
                                .parse()
                                .map_err(|_| WireError::BadAddress(addr.to_string()))?,
                            port: parse_port(port)?,
                        }),
                        _ => return Err(WireError::Malformed("KNOWNUSERS")),
                    }
                }
                Ok(Self::KnownUsers(entries))
            }
            other => Err(WireError::UnknownCommand(other.to_string())),
        }
    }

    /// Render the newline-terminated wire line.
    pub fn encode(&self) -> String {
        match self {
            Self::Join { handle, port } => format!("JOIN {handle} {port}\n"),
            Self::Leave { handle } => format!("LEAVE {handle}\n"),
            Self::Who => "WHO\n".to_string(),
            Self::KnownUsers(entries) => {
                if entries.is_empty() {
                    return "KNOWNUSERS\n".to_string();
                }
                let body = entries
                    .iter()
                    .map(|e| format!("{} {} {}", e.handle, e.addr, e.port))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("KNOWNUSERS {body}\n")
            }
        }
    }
}

// ── Data-port frames ──────────────────────────────────────────────────────────

/// A `MSG <sender> <text>` line — one text message, one TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    pub sender: String,
    pub text: String,
}

impl TextFrame {
    /// Parse a text frame. The text keeps its inner spaces.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(WireError::Empty);
        }
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("MSG"), Some(sender), Some(text)) if !sender.is_empty() => Ok(Self {
                sender: sender.to_string(),
                text: text.to_string(),
            }),
            (Some("MSG"), _, _) => Err(WireError::Malformed("MSG")),
            (Some(other), _, _) => Err(WireError::UnknownCommand(other.to_string())),
            _ => Err(WireError::Empty),
        }
    }

    pub fn encode(&self) -> String {
        format!("MSG {} {}\n", self.sender, self.text)
    }
}

/// An `IMG <sender> <byteLength>` header. Raw payload bytes follow the
/// newline, continuing across datagrams until `length` bytes arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub sender: String,
    pub length: usize,
}

impl ImageHeader {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("IMG"), Some(sender), Some(length), None) => Ok(Self {
                sender: sender.to_string(),
                length: length
                    .parse()
                    .map_err(|_| WireError::BadLength(length.to_string()))?,
            }),
            (Some("IMG"), _, _, _) => Err(WireError::Malformed("IMG")),
            (Some(other), _, _, _) => Err(WireError::UnknownCommand(other.to_string())),
            _ => Err(WireError::Empty),
        }
    }

    pub fn encode(&self) -> String {
        format!("IMG {} {}\n", self.sender, self.length)
    }
}

/// Split an opening image datagram into its header and the payload bytes
/// that share the datagram.
pub fn split_image_datagram(datagram: &[u8]) -> Result<(ImageHeader, &[u8]), WireError> {
    let newline = datagram
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(WireError::Malformed("IMG"))?;
    let header =
        std::str::from_utf8(&datagram[..newline]).map_err(|_| WireError::Malformed("IMG"))?;
    Ok((ImageHeader::parse(header)?, &datagram[newline + 1..]))
}

fn parse_port(field: &str) -> Result<u16, WireError> {
    field
        .parse()
        .map_err(|_| WireError::BadPort(field.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
///
/// All of them are recoverable — receive loops drop the offending
/// datagram or line and keep running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty line")]
    Empty,

    #[error("unknown command word: {0}")]
    UnknownCommand(String),

    #[error("malformed {0} line")]
    Malformed(&'static str),

    #[error("invalid peer address: {0}")]
    BadAddress(String),

    #[error("invalid port number: {0}")]
    BadPort(String),

    #[error("invalid byte length: {0}")]
    BadLength(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
