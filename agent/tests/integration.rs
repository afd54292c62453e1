// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for shutter-agent
//!
//! Runs a real agent against a real coordinator over loopback TCP.

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use image::RgbaImage;
use shutter_agent::capture::stub::StubCapture;
use shutter_agent::{
    Agent, AgentConfig, FrameCapture, Persistence, ScreenshotProcessor, TcpTransport,
    TestIdentifier,
};
use shutter_coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, RequestFailure};
use shutter_protocol::Orientation;

fn coordinator_on(port: u16) -> Coordinator {
    Coordinator::bind(CoordinatorConfig {
        port,
        request_timeout_ms: 5_000,
        retry_interval_ms: 1,
        idle_poll_ms: 10,
        ..Default::default()
    })
    .unwrap()
}

fn agent<C, P>(
    port: u16,
    output: &Path,
    capture: C,
    processor: ScreenshotProcessor<P>,
) -> Agent<TcpTransport, C, P>
where
    C: FrameCapture,
    P: Persistence,
{
    let config = AgentConfig {
        port,
        output_dir: output.to_path_buf(),
        reconnect_interval_ms: 20,
        retry_interval_ms: 1,
        ..Default::default()
    };
    let transport = TcpTransport::new(config.address(), Duration::from_secs(1));
    Agent::new(config, transport, capture, processor)
}

/// What the stub backend hands out on its first capture
fn first_frame(width: u32, height: u32) -> RgbaImage {
    StubCapture::new(width, height)
        .capture_frame()
        .unwrap()
        .into_rgba()
        .unwrap()
}

/// Run `agent` while `requests` talks to `coordinator`, then stop both.
fn with_agent<C, P>(
    coordinator: &Coordinator,
    agent: &mut Agent<TcpTransport, C, P>,
    requests: impl FnOnce(&Coordinator),
) where
    C: FrameCapture,
    P: Persistence,
{
    let handle = agent.handle();
    thread::scope(|s| {
        let runner = s.spawn(|| agent.run());
        requests(coordinator);
        handle.stop();
        runner.join().unwrap().unwrap();
    });
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn test_portrait_screenshot_matches_capture() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let coordinator = coordinator_on(0);
    let mut agent = agent(
        coordinator.port(),
        &out,
        StubCapture::new(48, 80),
        ScreenshotProcessor::new(&out),
    );

    with_agent(&coordinator, &mut agent, |coordinator| {
        coordinator
            .request_screenshot("tap", "LoginTest", "testTap", Orientation::Portrait)
            .unwrap();
    });

    let path = out.join("LoginTest/testTap/tap.png");
    let stored = image::open(&path).unwrap().to_rgba8();
    assert_eq!(stored, first_frame(48, 80));

    let shots = agent.processor().screenshots();
    assert_eq!(shots[&TestIdentifier::new("LoginTest", "testTap")], [path]);
    coordinator.shutdown();
}

#[test]
fn test_landscape_wide_frame_is_rotated() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_on(0);
    let mut agent = agent(
        coordinator.port(),
        dir.path(),
        StubCapture::new(800, 480),
        ScreenshotProcessor::new(dir.path()),
    );

    with_agent(&coordinator, &mut agent, |coordinator| {
        coordinator
            .request_screenshot("wide", "RotationTest", "landscape", Orientation::Landscape)
            .unwrap();
    });

    let stored = image::open(dir.path().join("RotationTest/landscape/wide.png"))
        .unwrap()
        .to_rgba8();
    assert_eq!(stored.dimensions(), (480, 800));
    assert_eq!(stored, image::imageops::rotate270(&first_frame(800, 480)));
}

#[test]
fn test_landscape_tall_frame_is_not_rotated() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_on(0);
    let mut agent = agent(
        coordinator.port(),
        dir.path(),
        StubCapture::new(480, 800),
        ScreenshotProcessor::new(dir.path()),
    );

    with_agent(&coordinator, &mut agent, |coordinator| {
        coordinator
            .request_screenshot("tall", "RotationTest", "landscape", Orientation::Landscape)
            .unwrap();
    });

    let stored = image::open(dir.path().join("RotationTest/landscape/tall.png"))
        .unwrap()
        .to_rgba8();
    assert_eq!(stored, first_frame(480, 800));
}

#[test]
fn test_tagged_requests_share_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_on(0);
    let mut agent = agent(
        coordinator.port(),
        dir.path(),
        StubCapture::new(4, 4),
        ScreenshotProcessor::new(dir.path()),
    );

    let mut names = Vec::new();
    with_agent(&coordinator, &mut agent, |coordinator| {
        for tag in ["before", "after"] {
            names.push(
                coordinator
                    .request_tagged(tag, "Login$Test", "testTap", Orientation::ReversePortrait)
                    .unwrap(),
            );
        }
    });

    let shots = &agent.processor().screenshots()[&TestIdentifier::new("Login_Test", "testTap")];
    let expected: Vec<PathBuf> = names
        .iter()
        .map(|name| dir.path().join("Login_Test/testTap").join(name))
        .collect();
    assert_eq!(shots, &expected);
    assert!(expected.iter().all(|path| path.is_file()));
}

// ============================================================================
// Failures
// ============================================================================

struct ReadOnly;

impl Persistence for ReadOnly {
    fn write(&mut self, _: &Path, _: &RgbaImage) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
    }
}

#[test]
fn test_persistence_failure_fails_request() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_on(0);
    let mut agent = agent(
        coordinator.port(),
        dir.path(),
        StubCapture::new(4, 4),
        ScreenshotProcessor::with_persistence(dir.path(), ReadOnly),
    );

    with_agent(&coordinator, &mut agent, |coordinator| {
        let err = coordinator
            .request_screenshot("tap", "LoginTest", "testTap", Orientation::Portrait)
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Failed(RequestFailure::CaptureFailed)
        ));

        // The agent reconnects and the coordinator keeps serving
        let err = coordinator
            .request_screenshot("again", "LoginTest", "testTap", Orientation::Portrait)
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Failed(RequestFailure::CaptureFailed)
        ));
    });

    assert!(agent.processor().screenshots().is_empty());
}

#[test]
fn test_agent_waits_for_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let mut agent = agent(
        port,
        dir.path(),
        StubCapture::new(4, 4),
        ScreenshotProcessor::new(dir.path()),
    );
    let handle = agent.handle();

    thread::scope(|s| {
        let runner = s.spawn(|| agent.run());

        // Let a few connection attempts fail first
        thread::sleep(Duration::from_millis(100));
        let coordinator = coordinator_on(port);
        coordinator
            .request_screenshot("late", "LoginTest", "testTap", Orientation::Portrait)
            .unwrap();

        handle.stop();
        runner.join().unwrap().unwrap();
        coordinator.shutdown();
    });

    assert!(dir.path().join("LoginTest/testTap/late.png").is_file());
}
