// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for shutter-protocol
//!
//! Exercises the frame codec over real loopback sockets in non-blocking mode.

use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use shutter_protocol::{
    CodecConfig, Command, FrameCodec, Orientation, ProtocolError, ScreenshotRequest,
};

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

fn config() -> CodecConfig {
    CodecConfig {
        retry_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_full_exchange_over_loopback() {
    let (client, server) = socket_pair();
    let mut coordinator = FrameCodec::new(server, config());
    let mut agent = FrameCodec::new(client, config());
    let timeout = Duration::from_secs(5);

    let request = ScreenshotRequest::new(
        "1700000000000_tap.png",
        "LoginTest",
        "testTap",
        Orientation::Landscape,
    );

    coordinator.write_command(Command::Start).unwrap();
    assert_eq!(agent.read_line_within(timeout).unwrap(), "START");

    agent.write_command(Command::Arguments).unwrap();
    assert_eq!(coordinator.read_line_within(timeout).unwrap(), "ARGUMENTS");

    coordinator.write_arguments(&request).unwrap();
    assert_eq!(agent.read_line_within(timeout).unwrap(), "ARGUMENTS");
    let received = agent
        .read_arguments(Some(std::time::Instant::now() + timeout))
        .unwrap();
    assert_eq!(received, request);

    agent.write_command(Command::Ready).unwrap();
    assert_eq!(coordinator.read_line_within(timeout).unwrap(), "READY");
}

#[test]
fn test_peer_close_reads_as_eof() {
    let (client, server) = socket_pair();
    let mut agent = FrameCodec::new(client, config());
    drop(server);

    let err = agent.read_line_within(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, ProtocolError::Eof | ProtocolError::Io(_)));
}

#[test]
fn test_idle_poll_on_silent_peer() {
    let (client, _server) = socket_pair();
    let mut agent = FrameCodec::new(client, config());
    assert!(agent.poll_line().unwrap().is_none());
}
