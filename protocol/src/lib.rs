// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Shutter wire protocol
//!
//! Definitions shared by the coordinator (the side that knows *when* and for
//! *which test* a screenshot is needed) and the capture agent (the side that
//! can actually grab the frame).
//!
//! # Wire format
//!
//! One command or argument value per line, UTF-8, newline terminated:
//!
//! ```text
//! C->A: START
//! A->C: ARGUMENTS
//! C->A: ARGUMENTS
//! C->A: <screenshotName>
//! C->A: <className>
//! C->A: <methodName>
//! C->A: <orientation:int>
//! A->C: READY
//! C->A: CAPTURE
//! A->C: CAPTURE_DONE
//! C->A: FINISHED
//! ```
//!
//! # Modules
//!
//! - [`command`]: Command vocabulary, orientation codes and the request payload
//! - [`state`]: Transition tables for both ends of a session
//! - [`codec`]: Line framing with bounded retries over non-blocking streams
//! - [`naming`]: Filesystem-safe names for test identifiers

pub mod codec;
pub mod command;
pub mod naming;
pub mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use codec::{CodecConfig, FrameCodec};
pub use command::*;
pub use state::{AgentAction, AgentState, CoordinatorAction, CoordinatorState};

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol error types.
///
/// Violations (`UnknownCommand`, `UnexpectedCommand`, `MalformedPayload`,
/// `LineTooLong`) mean both ends have diverged; the session must be torn down
/// rather than retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A line did not name any known command.
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    /// A known command arrived while the session was in a state that does not
    /// accept it.
    #[error("Unexpected command {command} in state {state}")]
    UnexpectedCommand {
        state: &'static str,
        command: Command,
    },

    /// An argument payload could not be decoded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A line exceeded the frame limit without a terminator.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    Eof,

    /// No complete line arrived before the read deadline.
    #[error("Timed out waiting for peer")]
    ReadTimeout,

    /// A write made no progress for the configured number of attempts.
    #[error("Write stalled after {0} attempts")]
    WriteTimeout(u32),

    /// The peer answered with `ERROR`.
    #[error("Peer reported an error")]
    PeerError,

    /// A blocking read was abandoned because the caller asked to stop.
    #[error("Cancelled")]
    Cancelled,

    /// Underlying stream failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Read or write budget exhausted.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::ReadTimeout | ProtocolError::WriteTimeout(_))
    }

    /// The two ends disagree about the conversation.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_)
                | ProtocolError::UnexpectedCommand { .. }
                | ProtocolError::MalformedPayload(_)
                | ProtocolError::LineTooLong(_)
        )
    }
}
