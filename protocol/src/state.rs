// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Session state machines
//!
//! Pure transition tables for both ends of a connection. Sessions feed every
//! received command through `on_command` and perform the returned action;
//! anything the table does not list is a protocol violation.

use std::fmt;

use crate::{Command, ProtocolError, Result};

/// Coordinator-side session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No request in flight; the agent is expected to stay silent
    #[default]
    Idle,
    /// `START` sent, waiting for the agent to ask for arguments
    AwaitArgumentsRequest,
    /// Arguments sent, waiting for `READY`
    AwaitReady,
    /// `CAPTURE` sent, waiting for `CAPTURE_DONE`
    AwaitCaptureDone,
}

/// What the coordinator must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Send the `ARGUMENTS` payload for the current request
    SendArguments,
    /// Send `CAPTURE`
    SendCapture,
    /// Send `FINISHED` and complete the request
    Finish,
}

impl CoordinatorState {
    pub fn name(self) -> &'static str {
        match self {
            CoordinatorState::Idle => "IDLE",
            CoordinatorState::AwaitArgumentsRequest => "AWAIT_ARGUMENTS_REQUEST",
            CoordinatorState::AwaitReady => "AWAIT_READY",
            CoordinatorState::AwaitCaptureDone => "AWAIT_CAPTURE_DONE",
        }
    }

    /// State entered after sending `START` for a newly claimed request.
    pub fn start(self) -> Result<CoordinatorState> {
        match self {
            CoordinatorState::Idle => Ok(CoordinatorState::AwaitArgumentsRequest),
            state => Err(ProtocolError::UnexpectedCommand {
                state: state.name(),
                command: Command::Start,
            }),
        }
    }

    /// Transition on a command received from the agent.
    pub fn on_command(self, command: Command) -> Result<(CoordinatorAction, CoordinatorState)> {
        use CoordinatorState::*;

        match (self, command) {
            (_, Command::Error) => Err(ProtocolError::PeerError),
            (AwaitArgumentsRequest, Command::Arguments) => {
                Ok((CoordinatorAction::SendArguments, AwaitReady))
            }
            (AwaitReady, Command::Ready) => Ok((CoordinatorAction::SendCapture, AwaitCaptureDone)),
            (AwaitCaptureDone, Command::CaptureDone) => Ok((CoordinatorAction::Finish, Idle)),
            (state, command) => Err(ProtocolError::UnexpectedCommand {
                state: state.name(),
                command,
            }),
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Agent-side session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentState {
    /// Connected, waiting for `START`
    #[default]
    Connected,
    /// Asked for arguments, waiting for the payload
    AwaitArgs,
    /// Arguments stored, waiting for `CAPTURE`
    AwaitCapture,
    /// Capture reported, waiting for `FINISHED`
    AwaitFinished,
}

/// What the agent must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Reply `ARGUMENTS` to ask for the payload
    RequestArguments,
    /// Read and store the argument values, then reply `READY`
    StoreArguments,
    /// Capture, post-process and reply `CAPTURE_DONE`
    Capture,
    /// Drop the stored arguments
    Clear,
}

impl AgentState {
    pub fn name(self) -> &'static str {
        match self {
            AgentState::Connected => "CONNECTED",
            AgentState::AwaitArgs => "AWAIT_ARGS",
            AgentState::AwaitCapture => "AWAIT_CAPTURE",
            AgentState::AwaitFinished => "AWAIT_FINISHED",
        }
    }

    /// Transition on a command received from the coordinator.
    pub fn on_command(self, command: Command) -> Result<(AgentAction, AgentState)> {
        use AgentState::*;

        match (self, command) {
            (_, Command::Error) => Err(ProtocolError::PeerError),
            (Connected, Command::Start) => Ok((AgentAction::RequestArguments, AwaitArgs)),
            (AwaitArgs, Command::Arguments) => Ok((AgentAction::StoreArguments, AwaitCapture)),
            (AwaitCapture, Command::Capture) => Ok((AgentAction::Capture, AwaitFinished)),
            (AwaitFinished, Command::Finished) => Ok((AgentAction::Clear, Connected)),
            (state, command) => Err(ProtocolError::UnexpectedCommand {
                state: state.name(),
                command,
            }),
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_happy_path() {
        let state = CoordinatorState::Idle.start().unwrap();
        assert_eq!(state, CoordinatorState::AwaitArgumentsRequest);

        let (action, state) = state.on_command(Command::Arguments).unwrap();
        assert_eq!(action, CoordinatorAction::SendArguments);
        let (action, state) = state.on_command(Command::Ready).unwrap();
        assert_eq!(action, CoordinatorAction::SendCapture);
        let (action, state) = state.on_command(Command::CaptureDone).unwrap();
        assert_eq!(action, CoordinatorAction::Finish);
        assert_eq!(state, CoordinatorState::Idle);
    }

    #[test]
    fn test_agent_happy_path() {
        let (action, state) = AgentState::Connected.on_command(Command::Start).unwrap();
        assert_eq!(action, AgentAction::RequestArguments);
        let (action, state) = state.on_command(Command::Arguments).unwrap();
        assert_eq!(action, AgentAction::StoreArguments);
        let (action, state) = state.on_command(Command::Capture).unwrap();
        assert_eq!(action, AgentAction::Capture);
        let (action, state) = state.on_command(Command::Finished).unwrap();
        assert_eq!(action, AgentAction::Clear);
        assert_eq!(state, AgentState::Connected);
    }

    #[test]
    fn test_coordinator_rejects_out_of_sequence() {
        // READY before the arguments were requested
        let err = CoordinatorState::AwaitArgumentsRequest
            .on_command(Command::Ready)
            .unwrap_err();
        assert!(err.is_violation());
        assert_eq!(
            err.to_string(),
            "Unexpected command READY in state AWAIT_ARGUMENTS_REQUEST"
        );

        // Nothing is accepted while idle
        for command in Command::ALL {
            CoordinatorState::Idle.on_command(command).unwrap_err();
        }

        // Cannot start twice
        CoordinatorState::AwaitReady.start().unwrap_err();
    }

    #[test]
    fn test_agent_rejects_out_of_sequence() {
        // CAPTURE before READY was sent
        let err = AgentState::AwaitArgs.on_command(Command::Capture).unwrap_err();
        assert!(err.is_violation());
        AgentState::Connected.on_command(Command::Finished).unwrap_err();
        AgentState::AwaitFinished.on_command(Command::Start).unwrap_err();
    }

    #[test]
    fn test_error_terminates_from_any_state() {
        for state in [
            CoordinatorState::Idle,
            CoordinatorState::AwaitArgumentsRequest,
            CoordinatorState::AwaitReady,
            CoordinatorState::AwaitCaptureDone,
        ] {
            assert!(matches!(
                state.on_command(Command::Error),
                Err(ProtocolError::PeerError)
            ));
        }
        for state in [
            AgentState::Connected,
            AgentState::AwaitArgs,
            AgentState::AwaitCapture,
            AgentState::AwaitFinished,
        ] {
            assert!(matches!(
                state.on_command(Command::Error),
                Err(ProtocolError::PeerError)
            ));
        }
    }
}
