// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Command vocabulary and request payload
//!
//! These definitions are the whole contract between coordinator and agent;
//! both binaries link this crate so there is nothing to keep in sync by hand.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// Well-known coordinator port
pub const DEFAULT_PORT: u16 = 42042;

/// Maximum frame length in bytes, terminator excluded
pub const MAX_LINE_LENGTH: usize = 512;

/// Number of value lines following an `ARGUMENTS` command
pub const ARGUMENT_LINES: usize = 4;

/// Prefix of the log line advertising a dynamically bound port
pub const PORT_ANNOUNCEMENT_PREFIX: &str = "port:";

/// Protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Coordinator has a request for the agent
    Start,
    /// Agent has its arguments and is ready to capture
    Ready,
    /// Coordinator asks the agent to capture now
    Capture,
    /// Agent captured and stored the frame
    CaptureDone,
    /// Agent asks for arguments / coordinator sends them
    Arguments,
    /// Coordinator acknowledges the capture; request is complete
    Finished,
    /// Either side gives up on the current exchange
    Error,
}

impl Command {
    /// All commands, in wire order of a successful exchange
    pub const ALL: [Command; 7] = [
        Command::Start,
        Command::Arguments,
        Command::Ready,
        Command::Capture,
        Command::CaptureDone,
        Command::Finished,
        Command::Error,
    ];

    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Ready => "READY",
            Command::Capture => "CAPTURE",
            Command::CaptureDone => "CAPTURE_DONE",
            Command::Arguments => "ARGUMENTS",
            Command::Finished => "FINISHED",
            Command::Error => "ERROR",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// Physical device orientation at request time
///
/// Discriminants are the platform screen-orientation codes carried on the
/// wire.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    Landscape = 0,
    #[default]
    Portrait = 1,
    ReverseLandscape = 8,
    ReversePortrait = 9,
}

impl Orientation {
    /// Wire code
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::ReverseLandscape => "reverse-landscape",
            Orientation::ReversePortrait => "reverse-portrait",
        }
    }
}

impl TryFrom<u32> for Orientation {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Orientation::Landscape),
            1 => Ok(Orientation::Portrait),
            8 => Ok(Orientation::ReverseLandscape),
            9 => Ok(Orientation::ReversePortrait),
            _ => Err(ProtocolError::MalformedPayload(format!(
                "invalid orientation code {value}"
            ))),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts either the kebab-case name or the numeric wire code.
impl FromStr for Orientation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u32>() {
            return Orientation::try_from(code);
        }
        [
            Orientation::Landscape,
            Orientation::Portrait,
            Orientation::ReverseLandscape,
            Orientation::ReversePortrait,
        ]
        .into_iter()
        .find(|orientation| orientation.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("invalid orientation {s:?}")))
    }
}

/// Identity of a single screenshot, as carried by the `ARGUMENTS` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRequest {
    /// File name of the screenshot
    pub name: String,
    /// Test class name
    pub class_name: String,
    /// Test method name
    pub method_name: String,
    /// Device orientation when the request was made
    pub orientation: Orientation,
}

impl ScreenshotRequest {
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        orientation: Orientation,
    ) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            orientation,
        }
    }

    /// Check that every value fits on a single non-empty frame.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("class name", &self.class_name),
            ("method name", &self.method_name),
        ] {
            if value.is_empty() {
                return Err(ProtocolError::MalformedPayload(format!("empty {field}")));
            }
            if value.contains(['\n', '\r']) {
                return Err(ProtocolError::MalformedPayload(format!(
                    "{field} contains a line break"
                )));
            }
            if value.len() > MAX_LINE_LENGTH {
                return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
            }
        }
        Ok(())
    }

    /// Encode as the full `ARGUMENTS` frame sequence, terminators included.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        Ok(format!(
            "{}\n{}\n{}\n{}\n{}\n",
            Command::Arguments,
            self.name,
            self.class_name,
            self.method_name,
            self.orientation.code()
        ))
    }

    /// Decode the value lines that follow an `ARGUMENTS` command, in
    /// positional order: name, class, method, orientation code.
    pub fn decode<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let [name, class_name, method_name, orientation] = values else {
            return Err(ProtocolError::MalformedPayload(format!(
                "expected {ARGUMENT_LINES} argument lines, got {}",
                values.len()
            )));
        };

        let code = orientation.as_ref().trim().parse::<u32>().map_err(|e| {
            ProtocolError::MalformedPayload(format!(
                "orientation {:?}: {e}",
                orientation.as_ref()
            ))
        })?;

        let request = ScreenshotRequest::new(
            name.as_ref(),
            class_name.as_ref(),
            method_name.as_ref(),
            Orientation::try_from(code)?,
        );
        request.validate()?;
        Ok(request)
    }
}

/// Extract the port from a `port:<N>` announcement line.
///
/// The line may carry a logger prefix; the last occurrence wins.
pub fn parse_port_announcement(line: &str) -> Option<u16> {
    let (_, rest) = line.rsplit_once(PORT_ANNOUNCEMENT_PREFIX)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().filter(|port| *port != 0)
}
