// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Shutter Coordinator
//!
//! The controller side of a screenshot exchange. It knows when a screenshot is
//! needed and for which test, hands that request to whichever capture agent is
//! connected, and blocks the caller until the agent reports the capture done.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Caller (test harness, CLI, ...)                │
//! │              Coordinator::request_screenshot()              │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ publish + wait
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Request Mailbox                         │
//! │  - single slot, one request system-wide                     │
//! │  - claimed by exactly one session                           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ claim / complete
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ Session     │   │ Session     │   │ Session     │
//! │ (thread per │   │             │   │             │
//! │ connection) │   │             │   │             │
//! └─────────────┘   └─────────────┘   └─────────────┘
//!                            │ line protocol over TCP
//!                            ▼
//!                     Capture agent(s)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shutter_coordinator::{Coordinator, CoordinatorConfig};
//! use shutter_protocol::Orientation;
//!
//! let coordinator = Coordinator::bind(CoordinatorConfig::default())?;
//! coordinator.request_screenshot("tap.png", "LoginTest", "testTap", Orientation::Portrait)?;
//! coordinator.shutdown();
//! ```

pub mod mailbox;
pub mod naming;
pub mod server;
pub mod session;

pub use mailbox::{Mailbox, RequestHandle, RequestId};
pub use server::{Coordinator, CoordinatorConfig};
pub use session::{Session, SessionConfig};

use shutter_protocol::ProtocolError;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Why a published request did not complete successfully.
///
/// Stored in the mailbox, so it only carries owned, cloneable data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestFailure {
    /// The session serving the request ran out of I/O budget.
    #[error("Timed out talking to the capture agent")]
    TimedOut,

    /// The agent answered `ERROR` instead of capturing.
    #[error("Capture agent failed to capture the screenshot")]
    CaptureFailed,

    /// The session serving the request was torn down.
    #[error("Session failed: {0}")]
    Session(String),

    /// The coordinator shut down before a session picked the request up.
    #[error("Coordinator shut down")]
    Shutdown,
}

impl From<&ProtocolError> for RequestFailure {
    fn from(err: &ProtocolError) -> Self {
        match err {
            e if e.is_timeout() => RequestFailure::TimedOut,
            ProtocolError::PeerError => RequestFailure::CaptureFailed,
            e => RequestFailure::Session(e.to_string()),
        }
    }
}

/// Coordinator error types.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The listening socket could not be set up.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Another request is outstanding.
    #[error("A screenshot request is already pending")]
    Busy,

    /// The request was not completed before its deadline.
    #[error("Timed out waiting for the screenshot")]
    Timeout,

    /// The request failed while being served.
    #[error(transparent)]
    Failed(#[from] RequestFailure),

    /// The screenshot tag contains characters outside `[A-Za-z0-9_-]`.
    #[error("Invalid tag {0:?}: must match [a-zA-Z0-9_-]+")]
    InvalidTag(String),

    /// The request cannot be put on the wire.
    #[error("Invalid request: {0}")]
    InvalidRequest(#[source] ProtocolError),

    /// A configuration file could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// True for every flavour of "gave up waiting".
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Timeout | CoordinatorError::Failed(RequestFailure::TimedOut)
        )
    }
}
