// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Coordinator-side session handler
//!
//! One session per accepted agent connection. While idle it sleeps on the
//! mailbox and watches the connection for end of stream; once it claims a
//! request it runs the handshake to completion and records the outcome.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use shutter_protocol::{
    CodecConfig, Command, CoordinatorAction, CoordinatorState, FrameCodec, ProtocolError, Result,
    ScreenshotRequest,
};

use crate::RequestFailure;
use crate::mailbox::Mailbox;

/// Default wait for the agent's `ARGUMENTS` and `READY` replies
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for `CAPTURE_DONE`
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default sleep between idle checks
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(100);

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Framing retry/stall budget
    pub codec: CodecConfig,
    /// Budget for handshake replies
    pub reply_timeout: Duration,
    /// Budget for the capture itself
    pub capture_timeout: Duration,
    /// How long an idle session sleeps on the mailbox between checks
    pub idle_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// Coordinator end of one agent connection
pub struct Session<S> {
    codec: FrameCodec<S>,
    state: CoordinatorState,
    peer: String,
    config: SessionConfig,
    served: u64,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, peer: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            codec: FrameCodec::new(stream, config.codec.clone()),
            state: CoordinatorState::Idle,
            peer: peer.into(),
            config,
            served: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Number of requests completed on this connection
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn into_inner(self) -> S {
        self.codec.into_inner()
    }

    /// Serve requests from `mailbox` until `shutdown` is set or the session
    /// fails. A failure while serving is recorded against the request before
    /// it is returned.
    pub fn run(&mut self, mailbox: &Mailbox, shutdown: &AtomicBool) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Session {}: shutting down after {} request(s)", self.peer, self.served);
                return Ok(());
            }

            // The agent speaks only when spoken to; this also notices a closed
            // connection before a request is committed to it.
            if let Some(line) = self.codec.poll_line()? {
                let command: Command = line.parse()?;
                return Err(ProtocolError::UnexpectedCommand {
                    state: self.state.name(),
                    command,
                });
            }

            let Some((id, request)) = mailbox.claim() else {
                mailbox.wait_for_work(self.config.idle_poll);
                continue;
            };

            info!("Session {}: serving request {id} ({})", self.peer, request.name);
            if let Err(e) = self.serve(&request) {
                mailbox.complete(id, Err(RequestFailure::from(&e)));
                return Err(e);
            }

            // The capture is stored once CAPTURE_DONE arrives; a failure to
            // acknowledge it only ends the session.
            mailbox.complete(id, Ok(()));
            self.served += 1;
            self.codec.write_command(Command::Finished)?;
            info!("Session {}: request {id} finished", self.peer);
        }
    }

    fn serve(&mut self, request: &ScreenshotRequest) -> Result<()> {
        self.state = self.state.start()?;
        self.codec.write_command(Command::Start)?;

        loop {
            let timeout = match self.state {
                CoordinatorState::AwaitCaptureDone => self.config.capture_timeout,
                _ => self.config.reply_timeout,
            };
            let command = self.codec.read_command(Some(Instant::now() + timeout), None)?;
            debug!("Session {}: {command} in state {}", self.peer, self.state);

            let (action, next) = self.state.on_command(command)?;
            match action {
                CoordinatorAction::SendArguments => self.codec.write_arguments(request)?,
                CoordinatorAction::SendCapture => self.codec.write_command(Command::Capture)?,
                CoordinatorAction::Finish => {}
            }
            self.state = next;

            if action == CoordinatorAction::Finish {
                return Ok(());
            }
        }
    }
}
