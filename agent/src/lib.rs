// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Shutter Capture Agent
//!
//! This crate provides the capture side of a shutter exchange: it runs where
//! the screen can actually be grabbed, connects to the coordinator and
//! answers its screenshot requests.
//!
//! # Overview
//!
//! For every request the agent:
//!
//! - **Captures** a raw frame through a [`capture::FrameCapture`] backend
//! - **Rotates** it upright according to the device orientation at request
//!   time
//! - **Stores** it as a PNG under `<output>/<class>/<method>/<name>`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Coordinator                            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ line protocol over TCP
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Agent                                  │
//! │  - reconnect loop (Transport)                               │
//! │  - agent session state machine                              │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ CAPTURE
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  FrameCapture (X11 / stub / PNG replay)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ raw frame + orientation
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ScreenshotProcessor                                        │
//! │  - opaque alpha, rotation                                   │
//! │  - Persistence (PNG files)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shutter_agent::{Agent, AgentConfig};
//!
//! let mut agent = Agent::from_config(AgentConfig::default())?;
//! let handle = agent.handle();
//! ctrlc::set_handler(move || handle.stop())?;
//! agent.run()?;
//! ```
//!
//! # Modules
//!
//! - [`capture`]: Frame capture backends
//! - [`processor`]: Rotation and persistence
//! - [`session`]: Agent side of the handshake
//! - [`agent`]: Connection management and configuration

pub mod agent;
pub mod capture;
pub mod processor;
pub mod session;

pub use agent::{Agent, AgentConfig, AgentHandle, TcpTransport, Transport};
pub use capture::{CaptureSource, CapturedFrame, FrameCapture, PixelFormat};
pub use processor::{Persistence, PngFiles, Rotation, ScreenshotProcessor, TestIdentifier};
pub use session::{AgentSession, SessionConfig};

use std::io;
use std::path::PathBuf;

use shutter_protocol::ProtocolError;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The coordinator could not be reached.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The capture backend failed or produced an unusable frame.
    #[error("Capture failed: {0}")]
    Capture(#[source] io::Error),

    /// The processed screenshot could not be stored.
    #[error("Failed to write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The session with the coordinator broke down.
    #[error(transparent)]
    Session(#[from] ProtocolError),

    /// The configuration could not be loaded.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
