use crate::*;

use palaver_services::messaging::{negotiate_port, TransportError};
use tokio::io::AsyncWriteExt;

/// A raw MSG line over TCP surfaces as a Message event.
#[tokio::test]
async fn inbound_text_emits_message_event() -> Result<()> {
    let mut fixture = start_messaging("text-in").await?;

    let mut stream = tokio::net::TcpStream::connect(service_addr(fixture.port)).await?;
    stream.write_all(b"MSG alice hi\n").await?;
    stream.shutdown().await?;

    match next_event(&mut fixture.events, |e| matches!(e, Event::Message { .. })).await? {
        Event::Message { sender, text } => {
            assert_eq!(sender, "alice");
            assert_eq!(text, "hi");
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// The full command path: SendText connects, writes, and the listener on
/// the far side reports the message.
#[tokio::test]
async fn send_text_end_to_end() -> Result<()> {
    let mut receiver = start_messaging("text-recv").await?;
    let sender = start_messaging("text-send").await?;

    sender.commands.send(MessagingCommand::SendText {
        from: "alice".into(),
        to: "bob".into(),
        text: "hi".into(),
        addr: "127.0.0.1".into(),
        port: receiver.port,
    })?;

    match next_event(&mut receiver.events, |e| matches!(e, Event::Message { .. })).await? {
        Event::Message { sender, text } => {
            assert_eq!(sender, "alice");
            assert_eq!(text, "hi");
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Oversize text is rejected locally: an Error event, no delivery.
#[tokio::test]
async fn oversize_text_is_rejected_locally() -> Result<()> {
    let mut fixture = start_messaging("text-oversize").await?;

    fixture.commands.send(MessagingCommand::SendText {
        from: "alice".into(),
        to: "bob".into(),
        text: "x".repeat(513),
        addr: "127.0.0.1".into(),
        port: fixture.port,
    })?;

    match next_event(&mut fixture.events, |e| {
        matches!(e, Event::Error(_) | Event::Message { .. })
    })
    .await?
    {
        Event::Error(message) => assert!(message.contains("513"), "error: {message}"),
        Event::Message { .. } => panic!("oversize text reached the listener"),
        _ => unreachable!(),
    }
    Ok(())
}

/// A garbled line on the text port is dropped; the next connection still
/// gets through.
#[tokio::test]
async fn garbled_text_line_is_dropped() -> Result<()> {
    let mut fixture = start_messaging("text-garbled").await?;

    let mut bad = tokio::net::TcpStream::connect(service_addr(fixture.port)).await?;
    bad.write_all(b"HELLO no frame here\n").await?;
    bad.shutdown().await?;

    let mut good = tokio::net::TcpStream::connect(service_addr(fixture.port)).await?;
    good.write_all(b"MSG bob still alive\n").await?;
    good.shutdown().await?;

    match next_event(&mut fixture.events, |e| matches!(e, Event::Message { .. })).await? {
        Event::Message { sender, text } => {
            assert_eq!(sender, "bob");
            assert_eq!(text, "still alive");
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// A fully occupied range is fatal: PortExhausted, and no TcpPort event.
#[tokio::test]
async fn occupied_range_reports_port_exhausted() -> Result<()> {
    let guard = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
    let taken = guard.local_addr()?.port();

    let (event_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let (_cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    let (shutdown, _) = tokio::sync::broadcast::channel(1);

    let result = MessagingService::bind(
        (taken, taken),
        std::env::temp_dir().join("palaver-unused"),
        event_tx,
        cmd_rx,
        shutdown.subscribe(),
    )
    .await;

    match result {
        Err(TransportError::PortExhausted { low, high }) => {
            assert_eq!((low, high), (taken, taken));
        }
        Ok(_) => panic!("bind succeeded on an occupied range"),
        Err(other) => panic!("expected PortExhausted, got {other:?}"),
    }

    match events.try_recv() {
        Ok(Event::Error(message)) => assert!(message.contains("no free data port")),
        other => panic!("expected an Error event, got {other:?}"),
    }
    assert!(events.try_recv().is_err(), "no further events expected");
    Ok(())
}

/// The scan skips occupied ports and settles on the first free one.
#[tokio::test]
async fn port_scan_skips_occupied_ports() -> Result<()> {
    let guard = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
    let taken = guard.local_addr()?.port();

    let (_tcp, _udp, port) = negotiate_port(taken, taken.saturating_add(20)).await?;
    assert!(port > taken && port <= taken.saturating_add(20));
    Ok(())
}
