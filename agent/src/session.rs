// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Agent side of a coordinator connection

use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use shutter_protocol::{
    AgentAction, AgentState, CodecConfig, Command, FrameCodec, ProtocolError, ScreenshotRequest,
};

use crate::capture::FrameCapture;
use crate::processor::{Persistence, ScreenshotProcessor};
use crate::{AgentError, Result};

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Framing retry/stall budget
    pub codec: CodecConfig,
    /// How long to wait for the coordinator mid-handshake. Between requests
    /// the session waits indefinitely.
    pub reply_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// Agent end of one connection
pub struct AgentSession<S> {
    codec: FrameCodec<S>,
    state: AgentState,
    arguments: Option<ScreenshotRequest>,
    reply_timeout: Duration,
    captured: u64,
}

impl<S: Read + Write> AgentSession<S> {
    pub fn new(stream: S, config: SessionConfig) -> Self {
        Self {
            codec: FrameCodec::new(stream, config.codec),
            state: AgentState::Connected,
            arguments: None,
            reply_timeout: config.reply_timeout,
            captured: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Screenshots completed on this connection
    pub fn captured(&self) -> u64 {
        self.captured
    }

    pub fn into_inner(self) -> S {
        self.codec.into_inner()
    }

    /// Answer requests until the coordinator goes away, the conversation
    /// breaks, or `stop` is set between requests. Stopping is not an error.
    pub fn run<C, P>(
        &mut self,
        capture: &mut C,
        processor: &mut ScreenshotProcessor<P>,
        stop: &AtomicBool,
    ) -> Result<()>
    where
        C: FrameCapture + ?Sized,
        P: Persistence,
    {
        loop {
            // Stopping only interrupts the wait for the next request; a
            // started handshake runs to completion under the reply timeout.
            let (deadline, cancel) = match self.state {
                AgentState::Connected => (None, Some(stop)),
                _ => (Some(Instant::now() + self.reply_timeout), None),
            };

            let command = match self.codec.read_command(deadline, cancel) {
                Ok(command) => command,
                Err(ProtocolError::Cancelled) => {
                    info!("Session stopped after {} capture(s)", self.captured);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            debug!("{command} in state {}", self.state);

            let (action, next) = self.state.on_command(command)?;
            match action {
                AgentAction::RequestArguments => self.codec.write_command(Command::Arguments)?,
                AgentAction::StoreArguments => {
                    let request = self.codec.read_arguments(deadline)?;
                    debug!("Arguments: {request:?}");
                    self.arguments = Some(request);
                    self.codec.write_command(Command::Ready)?;
                }
                AgentAction::Capture => {
                    if let Err(e) = self.capture(capture, processor) {
                        warn!("Screenshot failed: {e}");
                        // Best effort; the session ends either way
                        if let Err(write_err) = self.codec.write_command(Command::Error) {
                            debug!("Could not report failure: {write_err}");
                        }
                        return Err(e);
                    }
                    self.codec.write_command(Command::CaptureDone)?;
                }
                AgentAction::Clear => {
                    self.arguments = None;
                    self.captured += 1;
                }
            }
            self.state = next;
        }
    }

    fn capture<C, P>(&self, capture: &mut C, processor: &mut ScreenshotProcessor<P>) -> Result<()>
    where
        C: FrameCapture + ?Sized,
        P: Persistence,
    {
        let request = self.arguments.as_ref().ok_or(ProtocolError::UnexpectedCommand {
            state: self.state.name(),
            command: Command::Capture,
        })?;

        let frame = capture.capture_frame().map_err(AgentError::Capture)?;
        processor.process(frame, request)?;
        Ok(())
    }
}
