// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture agent main implementation
//!
//! Keeps a connection to the coordinator alive and runs one agent session
//! per connection.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use shutter_protocol::{CodecConfig, DEFAULT_PORT, ProtocolError};

use crate::capture::{self, CaptureSource, FrameCapture};
use crate::processor::{Persistence, PngFiles, ScreenshotProcessor};
use crate::session::{AgentSession, SessionConfig};
use crate::{AgentError, Result};

/// Longest uninterrupted sleep while waiting to reconnect
const STOP_POLL: Duration = Duration::from_millis(50);

/// Capture agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Coordinator host
    pub host: String,
    /// Coordinator port
    pub port: u16,
    /// Root directory screenshots are stored under
    pub output_dir: PathBuf,
    /// Empty the output directory once before the first connection
    pub clear_output: bool,
    /// Pause between connection attempts
    pub reconnect_interval_ms: u64,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
    /// How long to wait for the coordinator mid-handshake
    pub reply_timeout_ms: u64,
    /// Pause between I/O attempts that make no progress
    pub retry_interval_ms: u64,
    /// Consecutive stalled writes before the session gives up
    pub max_write_stalls: u32,
    /// Capture backend
    pub capture: CaptureSource,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            output_dir: PathBuf::from("screenshots"),
            clear_output: false,
            reconnect_interval_ms: 1_000,
            connect_timeout_ms: 1_000,
            reply_timeout_ms: 5_000,
            retry_interval_ms: 10,
            max_write_stalls: 5,
            capture: CaptureSource::default(),
        }
    }
}

impl AgentConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            codec: CodecConfig {
                retry_interval: Duration::from_millis(self.retry_interval_ms),
                max_write_stalls: self.max_write_stalls,
            },
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

/// Source of connections to the coordinator
pub trait Transport: Send {
    type Stream: Read + Write;

    fn connect(&mut self) -> io::Result<Self::Stream>;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// Plain TCP, switched to non-blocking once connected
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn connect(&mut self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Address resolved to nothing")
        }))
    }

    fn peer(&self) -> String {
        self.address.clone()
    }
}

/// Stops a running [`Agent`] from another thread
#[derive(Debug, Clone)]
pub struct AgentHandle {
    stop: Arc<AtomicBool>,
}

impl AgentHandle {
    /// Ask the agent to stop. Honoured between connection attempts and while
    /// waiting for a request; a capture in progress completes first.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Capture Agent
pub struct Agent<T, C, P = PngFiles> {
    /// Configuration
    config: AgentConfig,
    /// Connection source
    transport: T,
    /// Frame capture backend
    capture: C,
    /// Rotation and storage
    processor: ScreenshotProcessor<P>,
    /// Stop flag shared with handles
    stop: Arc<AtomicBool>,
    /// Output cleared already
    cleared: bool,
    /// Completed sessions
    sessions: u64,
}

impl Agent<TcpTransport, Box<dyn FrameCapture>, PngFiles> {
    /// Build an agent with the TCP transport, the configured capture backend
    /// and PNG file output.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let capture = capture::open(&config.capture).map_err(AgentError::Capture)?;
        let (width, height) = capture.dimensions();
        info!("Capturing {width}x{height} frames from {:?}", config.capture);
        let transport = TcpTransport::new(
            config.address(),
            Duration::from_millis(config.connect_timeout_ms),
        );
        let processor = ScreenshotProcessor::new(config.output_dir.clone());
        Ok(Self::new(config, transport, capture, processor))
    }
}

impl<T, C, P> Agent<T, C, P>
where
    T: Transport,
    C: FrameCapture,
    P: Persistence,
{
    pub fn new(
        config: AgentConfig,
        transport: T,
        capture: C,
        processor: ScreenshotProcessor<P>,
    ) -> Self {
        Self {
            config,
            transport,
            capture,
            processor,
            stop: Arc::new(AtomicBool::new(false)),
            cleared: false,
            sessions: 0,
        }
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn processor(&self) -> &ScreenshotProcessor<P> {
        &self.processor
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// One connection attempt
    pub fn connect(&mut self) -> Result<T::Stream> {
        self.transport
            .connect()
            .map_err(|source| AgentError::Connect {
                address: self.transport.peer(),
                source,
            })
    }

    /// Connect, serve, reconnect, until stopped.
    ///
    /// Only fails if the output directory cannot be prepared; connection and
    /// session failures are logged and retried.
    pub fn run(&mut self) -> Result<()> {
        if self.config.clear_output && !self.cleared {
            self.processor.clear_output()?;
            self.cleared = true;
        }

        info!(
            "Agent started, coordinator {}, output {}",
            self.transport.peer(),
            self.processor.output_root().display()
        );

        while !self.is_stopped() {
            match self.connect() {
                Ok(stream) => self.serve(stream),
                Err(e) => warn!("{e}"),
            }
            if self.is_stopped() {
                break;
            }

            info!(
                "Reconnecting in {} ms",
                self.config.reconnect_interval().as_millis()
            );
            self.pause(self.config.reconnect_interval());
        }

        info!("Agent stopped after {} session(s)", self.sessions);
        Ok(())
    }

    fn serve(&mut self, stream: T::Stream) {
        info!("Connected to coordinator {}", self.transport.peer());
        let mut session = AgentSession::new(stream, self.config.session_config());
        let result = session.run(&mut self.capture, &mut self.processor, &self.stop);
        self.sessions += 1;

        match result {
            Ok(()) => info!("Session closed"),
            Err(AgentError::Session(ProtocolError::Eof)) => {
                info!("Coordinator closed the connection");
            }
            Err(AgentError::Session(e)) if e.is_violation() => error!("Session aborted: {e}"),
            Err(e) => warn!("Session ended: {e}"),
        }
    }

    /// Sleep for `total`, waking early when stopped
    fn pause(&self, total: Duration) {
        let until = Instant::now() + total;
        while !self.is_stopped() {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(STOP_POLL));
        }
    }
}
