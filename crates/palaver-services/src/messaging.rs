//! Messaging transport — TCP text delivery and chunked UDP image
//! transfer on a single negotiated data port.
//!
//! The port is found by scanning the configured range; TCP and UDP bind
//! the same number so one `JOIN` announcement covers both channels. Text
//! is one `MSG` line per connection. Images arrive as an `IMG` header
//! datagram followed by raw chunks, reassembled in order and written to
//! the image directory. Delivery of chunks is best-effort — no acks, no
//! retransmission.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};

use palaver_core::wire::{
    split_image_datagram, ImageHeader, TextFrame, DATA_BUFFER, IMAGE_CHUNK_SIZE, MAX_TEXT_LEN,
};

use crate::channel::{Event, EventSender, MessagingCommand};

/// Timeout for each candidate address of an outbound text send.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures raised by the messaging transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No free port in the configured range — the one fatal condition.
    #[error("no free data port in range {low}..={high}")]
    PortExhausted { low: u16, high: u16 },

    /// All candidate addresses failed, or the payload could not be read.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// Text over the wire limit, rejected before any network attempt.
    #[error("message length {len} exceeds {} characters", MAX_TEXT_LEN)]
    OversizeMessage { len: usize },
}

/// Scan the inclusive range ascending; the first port where both a TCP
/// listener and a UDP socket bind wins.
pub async fn negotiate_port(
    low: u16,
    high: u16,
) -> Result<(TcpListener, UdpSocket, u16), TransportError> {
    for port in low..=high {
        let tcp = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::debug!(port, error = %e, "tcp bind failed, trying next port");
                continue;
            }
        };
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(udp) => return Ok((tcp, udp, port)),
            Err(e) => {
                tracing::debug!(port, error = %e, "udp bind failed, trying next port");
                continue;
            }
        }
    }
    Err(TransportError::PortExhausted { low, high })
}

/// One in-flight image reassembly. The transport accepts one image at a
/// time; a new `IMG` header replaces a stalled assembly.
struct ImageAssembly {
    sender: String,
    expected: usize,
    payload: BytesMut,
}

pub struct MessagingService {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    port: u16,
    image_dir: PathBuf,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<MessagingCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl MessagingService {
    /// Negotiate a data port and assemble the service. Emits `TcpPort` on
    /// success so the front end can join discovery under it; a fully
    /// occupied range emits `Error` and fails.
    pub async fn bind(
        port_range: (u16, u16),
        image_dir: PathBuf,
        events: EventSender,
        commands: mpsc::UnboundedReceiver<MessagingCommand>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, TransportError> {
        let (low, high) = port_range;
        let (tcp, udp, port) = match negotiate_port(low, high).await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(low, high, "no free data port in range");
                let _ = events.send(Event::Error(e.to_string()));
                return Err(e);
            }
        };
        tracing::info!(port, "messaging service bound");
        let _ = events.send(Event::TcpPort(port));
        Ok(Self {
            tcp,
            udp: Arc::new(udp),
            port,
            image_dir,
            events,
            commands,
            shutdown,
        })
    }

    /// The negotiated data port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        let mut buf = vec![0u8; DATA_BUFFER];
        let mut assembly: Option<ImageAssembly> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("messaging service shutting down");
                    return Ok(());
                }

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::info!("command channel closed, messaging service stopping");
                        return Ok(());
                    }
                },

                result = self.tcp.accept() => match result {
                    Ok((stream, from)) => self.handle_connection(stream, from),
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                        self.emit_error(format!("accept failed: {e}"));
                    }
                },

                result = self.udp.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from, &mut assembly).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv_from failed");
                        self.emit_error(format!("image receive failed: {e}"));
                    }
                },
            }
        }
    }

    // ── Inbound text ─────────────────────────────────────────────────────────

    /// One message per connection: read to the newline, emit, done. The
    /// connection is handed to its own task so a slow writer cannot stall
    /// the accept path.
    fn handle_connection(&self, stream: TcpStream, from: SocketAddr) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut line = String::new();
            let mut reader = BufReader::new(stream);
            match reader.read_line(&mut line).await {
                Ok(0) => tracing::trace!(%from, "connection closed before a full line"),
                Ok(_) => match TextFrame::parse(&line) {
                    Ok(frame) => {
                        tracing::debug!(sender = %frame.sender, %from, "text received");
                        let _ = events.send(Event::Message {
                            sender: frame.sender,
                            text: frame.text,
                        });
                    }
                    Err(e) => tracing::trace!(%from, error = %e, "undecodable text frame dropped"),
                },
                Err(e) => tracing::trace!(%from, error = %e, "text read failed"),
            }
        });
    }

    // ── Inbound images ───────────────────────────────────────────────────────

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        assembly: &mut Option<ImageAssembly>,
    ) {
        if datagram.starts_with(b"IMG") {
            match split_image_datagram(datagram) {
                Ok((header, first)) => {
                    if assembly.is_some() {
                        tracing::debug!(%from, "new image header replaces unfinished assembly");
                    }
                    let mut payload = BytesMut::with_capacity(header.length);
                    payload.extend_from_slice(first);
                    *assembly = Some(ImageAssembly {
                        sender: header.sender,
                        expected: header.length,
                        payload,
                    });
                }
                Err(e) => {
                    tracing::trace!(%from, error = %e, "undecodable image header dropped");
                    return;
                }
            }
        } else if let Some(current) = assembly.as_mut() {
            current.payload.extend_from_slice(datagram);
        } else {
            tracing::trace!(%from, len = datagram.len(), "stray data datagram dropped");
            return;
        }

        let complete = assembly
            .as_ref()
            .is_some_and(|a| a.payload.len() >= a.expected);
        if complete {
            let done = assembly.take().expect("assembly checked above");
            self.finish_image(done);
        }
    }

    fn finish_image(&self, assembly: ImageAssembly) {
        let mut payload = assembly.payload;
        payload.truncate(assembly.expected);
        match save_image(&self.image_dir, &assembly.sender, &payload) {
            Ok(path) => {
                tracing::info!(
                    sender = %assembly.sender,
                    bytes = assembly.expected,
                    path = %path.display(),
                    "image received"
                );
                let _ = self.events.send(Event::Image {
                    sender: assembly.sender,
                    path,
                });
            }
            Err(e) => {
                tracing::warn!(sender = %assembly.sender, error = %e, "image store failed");
                self.emit_error(format!("failed to store image: {e}"));
            }
        }
    }

    // ── Front-end commands ───────────────────────────────────────────────────

    async fn handle_command(&self, cmd: MessagingCommand) {
        match cmd {
            MessagingCommand::SendText {
                from,
                to,
                text,
                addr,
                port,
            } => {
                if let Err(e) = send_text(&from, &text, &addr, port).await {
                    tracing::warn!(%to, error = %e, "text send failed");
                    self.emit_error(e.to_string());
                }
            }
            MessagingCommand::SendImage {
                from,
                to,
                path,
                addr,
                port,
            } => {
                if let Err(e) = self.send_image(&from, &path, &addr, port).await {
                    tracing::warn!(%to, error = %e, "image send failed");
                    self.emit_error(e.to_string());
                }
            }
        }
    }

    async fn send_image(
        &self,
        from: &str,
        path: &Path,
        addr: &str,
        port: u16,
    ) -> Result<(), TransportError> {
        let payload = std::fs::read(path)
            .map_err(|e| TransportError::SendFailure(format!("read {}: {e}", path.display())))?;
        let dest = resolve_one(addr, port).await?;
        send_image_bytes(&self.udp, from, &payload, dest).await
    }

    fn emit_error(&self, message: String) {
        let _ = self.events.send(Event::Error(message));
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Deliver one `MSG` line to `addr:port` over TCP.
///
/// Oversize text is rejected before any network activity. Resolution may
/// yield candidates in both address families; each gets one timed
/// connect attempt, first success wins.
pub async fn send_text(from: &str, text: &str, addr: &str, port: u16) -> Result<(), TransportError> {
    let len = text.chars().count();
    if len > MAX_TEXT_LEN {
        return Err(TransportError::OversizeMessage { len });
    }

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((addr, port))
        .await
        .map_err(|e| TransportError::SendFailure(format!("resolve {addr}:{port}: {e}")))?
        .collect();

    let frame = TextFrame {
        sender: from.to_string(),
        text: text.to_string(),
    }
    .encode();

    let mut last_failure = format!("no candidate addresses for {addr}:{port}");
    for dest in candidates {
        match tokio::time::timeout(SEND_TIMEOUT, connect_and_write(dest, frame.as_bytes())).await {
            Ok(Ok(())) => {
                tracing::debug!(%dest, bytes = frame.len(), "text delivered");
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!(%dest, error = %e, "candidate failed");
                last_failure = format!("{dest}: {e}");
            }
            Err(_) => {
                tracing::debug!(%dest, "candidate timed out");
                last_failure = format!("{dest}: connect timed out");
            }
        }
    }
    Err(TransportError::SendFailure(last_failure))
}

async fn connect_and_write(dest: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(dest).await?;
    stream.write_all(frame).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Stream an image as an `IMG` header sharing its datagram with the
/// first chunk, then the rest of the payload in fixed-size chunks.
pub async fn send_image_bytes(
    socket: &UdpSocket,
    from: &str,
    payload: &[u8],
    dest: SocketAddr,
) -> Result<(), TransportError> {
    let header = ImageHeader {
        sender: from.to_string(),
        length: payload.len(),
    }
    .encode();

    let first_len = payload.len().min(IMAGE_CHUNK_SIZE);
    let mut first = Vec::with_capacity(header.len() + first_len);
    first.extend_from_slice(header.as_bytes());
    first.extend_from_slice(&payload[..first_len]);

    socket
        .send_to(&first, dest)
        .await
        .map_err(|e| TransportError::SendFailure(format!("{dest}: {e}")))?;
    let mut datagrams = 1usize;
    for chunk in payload[first_len..].chunks(IMAGE_CHUNK_SIZE) {
        socket
            .send_to(chunk, dest)
            .await
            .map_err(|e| TransportError::SendFailure(format!("{dest}: {e}")))?;
        datagrams += 1;
    }

    tracing::debug!(%dest, bytes = payload.len(), datagrams, "image sent");
    Ok(())
}

async fn resolve_one(addr: &str, port: u16) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host((addr, port))
        .await
        .map_err(|e| TransportError::SendFailure(format!("resolve {addr}:{port}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::SendFailure(format!("no addresses for {addr}:{port}")))
}

fn save_image(dir: &Path, sender: &str, payload: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = dir.join(format!("{sender}_{stamp}.img"));
    std::fs::write(&path, payload)?;
    Ok(path)
}
