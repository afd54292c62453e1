// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Line framing over non-blocking byte streams
//!
//! Reads accumulate into a buffer that is split on `\n`. An empty read
//! (`WouldBlock`) sleeps for the retry interval instead of spinning, bounded by
//! an optional deadline; a zero-length read is end of stream. Writes loop
//! until the whole frame is out and give up after a fixed number of
//! consecutive attempts that make no progress.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::{ARGUMENT_LINES, Command, MAX_LINE_LENGTH, ProtocolError, Result, ScreenshotRequest};

/// Default pause between I/O attempts on a stream with no progress
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Default number of consecutive stalled write attempts before giving up
pub const DEFAULT_MAX_WRITE_STALLS: u32 = 5;

/// Codec tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Sleep between attempts when the stream has nothing to give or take
    pub retry_interval: Duration,
    /// Consecutive no-progress writes tolerated before `WriteTimeout`
    pub max_write_stalls: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_write_stalls: DEFAULT_MAX_WRITE_STALLS,
        }
    }
}

enum Fill {
    Data,
    Empty,
}

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Line codec over any byte stream
///
/// Intended for sockets in non-blocking mode, but works with blocking
/// streams too (reads then simply never report `WouldBlock`).
pub struct FrameCodec<S> {
    stream: S,
    config: CodecConfig,
    buffer: Vec<u8>,
}

impl<S: Read + Write> FrameCodec<S> {
    pub fn new(stream: S, config: CodecConfig) -> Self {
        Self {
            stream,
            config,
            buffer: Vec::with_capacity(MAX_LINE_LENGTH),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Write a single frame. `line` must not contain a line break.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        if line.contains(['\n', '\r']) {
            return Err(ProtocolError::MalformedPayload(
                "frame contains a line break".to_string(),
            ));
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
        }

        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push('\n');
        self.write_frame(frame.as_bytes())
    }

    pub fn write_command(&mut self, command: Command) -> Result<()> {
        trace!("-> {command}");
        self.write_line(command.as_str())
    }

    /// Write `ARGUMENTS` followed by the four value lines.
    pub fn write_arguments(&mut self, request: &ScreenshotRequest) -> Result<()> {
        let frames = request.encode()?;
        trace!("-> {} {request:?}", Command::Arguments);
        self.write_frame(frames.as_bytes())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let max_stalls = self.config.max_write_stalls.max(1);
        let mut written = 0;
        let mut stalls = 0;

        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {}
                Ok(n) => {
                    written += n;
                    stalls = 0;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(e.kind()) => {}
                Err(e) => return Err(e.into()),
            }

            stalls += 1;
            if stalls >= max_stalls {
                return Err(ProtocolError::WriteTimeout(stalls));
            }
            thread::sleep(self.config.retry_interval);
        }

        self.flush(max_stalls)
    }

    fn flush(&mut self, max_stalls: u32) -> Result<()> {
        let mut stalls = 0;
        loop {
            match self.stream.flush() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(e.kind()) => {
                    stalls += 1;
                    if stalls >= max_stalls {
                        return Err(ProtocolError::WriteTimeout(stalls));
                    }
                    thread::sleep(self.config.retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read one frame.
    ///
    /// Waits until `deadline` (forever if `None`) and gives up early with
    /// `Cancelled` once `cancel` is set.
    pub fn read_line(
        &mut self,
        deadline: Option<Instant>,
        cancel: Option<&AtomicBool>,
    ) -> Result<String> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Err(ProtocolError::Cancelled);
            }

            match self.fill()? {
                Fill::Data => {}
                Fill::Empty => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(ProtocolError::ReadTimeout);
                    }
                    thread::sleep(self.config.retry_interval);
                }
            }
        }
    }

    /// Read one frame, waiting at most `timeout`.
    pub fn read_line_within(&mut self, timeout: Duration) -> Result<String> {
        self.read_line(Some(Instant::now() + timeout), None)
    }

    /// Single non-blocking attempt: a buffered or freshly arrived frame, or
    /// `None` if the peer is silent. End of stream is still an error.
    pub fn poll_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.take_line()? {
            return Ok(Some(line));
        }
        match self.fill()? {
            Fill::Data => self.take_line(),
            Fill::Empty => Ok(None),
        }
    }

    pub fn read_command(
        &mut self,
        deadline: Option<Instant>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Command> {
        let line = self.read_line(deadline, cancel)?;
        let command = line.parse()?;
        trace!("<- {command}");
        Ok(command)
    }

    /// Read the four value lines that follow an `ARGUMENTS` command.
    pub fn read_arguments(&mut self, deadline: Option<Instant>) -> Result<ScreenshotRequest> {
        let mut values = Vec::with_capacity(ARGUMENT_LINES);
        for _ in 0..ARGUMENT_LINES {
            values.push(self.read_line(deadline, None)?);
        }
        let request = ScreenshotRequest::decode(&values)?;
        trace!("<- {} {request:?}", Command::Arguments);
        Ok(request)
    }

    fn fill(&mut self) -> Result<Fill> {
        let mut chunk = [0u8; MAX_LINE_LENGTH];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ProtocolError::Eof),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(e.kind()) => return Ok(Fill::Empty),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<String>> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            // Leave room for a trailing '\r' that is not part of the frame
            if self.buffer.len() > MAX_LINE_LENGTH + 1 {
                return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
            }
            return Ok(None);
        };

        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
        }

        String::from_utf8(line)
            .map(Some)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Orientation;
    use crate::testing::MockStream;

    fn fast() -> CodecConfig {
        CodecConfig {
            retry_interval: Duration::from_millis(1),
            max_write_stalls: 5,
        }
    }

    #[test]
    fn test_reads_split_across_chunks() {
        let stream = MockStream::new()
            .data("STA")
            .would_block()
            .data("RT\nREA")
            .data("DY\r\n");
        let mut codec = FrameCodec::new(stream, fast());

        assert_eq!(codec.read_command(None, None).unwrap(), Command::Start);
        assert_eq!(codec.read_command(None, None).unwrap(), Command::Ready);
    }

    #[test]
    fn test_eof_is_connection_failure() {
        let stream = MockStream::new().data("START\n").eof();
        let mut codec = FrameCodec::new(stream, fast());

        assert_eq!(codec.read_line(None, None).unwrap(), "START");
        assert!(matches!(codec.read_line(None, None), Err(ProtocolError::Eof)));
    }

    #[test]
    fn test_read_times_out_on_silence() {
        let mut codec = FrameCodec::new(MockStream::new(), fast());
        let start = Instant::now();
        let err = codec.read_line_within(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ProtocolError::ReadTimeout));
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_read_cancelled() {
        let cancel = AtomicBool::new(true);
        let mut codec = FrameCodec::new(MockStream::new(), fast());
        assert!(matches!(
            codec.read_line(None, Some(&cancel)),
            Err(ProtocolError::Cancelled)
        ));
    }

    #[test]
    fn test_line_too_long() {
        let long = "A".repeat(MAX_LINE_LENGTH + 10);
        let mut codec = FrameCodec::new(MockStream::new().data(long.as_str()), fast());
        assert!(matches!(
            codec.read_line(None, None),
            Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH))
        ));

        let mut codec = FrameCodec::new(MockStream::new(), fast());
        codec.write_line(&long).unwrap_err();
    }

    #[test]
    fn test_unknown_token() {
        let mut codec = FrameCodec::new(MockStream::new().data("HELLO\n"), fast());
        let err = codec.read_command(None, None).unwrap_err();
        assert!(err.is_violation());
    }

    #[test]
    fn test_poll_line() {
        let mut codec = FrameCodec::new(MockStream::new(), fast());
        assert!(codec.poll_line().unwrap().is_none());

        let mut codec = FrameCodec::new(MockStream::new().data("READY\n"), fast());
        assert_eq!(codec.poll_line().unwrap().as_deref(), Some("READY"));

        let mut codec = FrameCodec::new(MockStream::new().eof(), fast());
        assert!(matches!(codec.poll_line(), Err(ProtocolError::Eof)));
    }

    #[test]
    fn test_write_arguments() {
        let mut codec = FrameCodec::new(MockStream::new(), fast());
        let request = ScreenshotRequest::new("tap", "LoginTest", "testTap", Orientation::Landscape);
        codec.write_arguments(&request).unwrap();
        assert_eq!(
            codec.get_ref().written_lines(),
            ["ARGUMENTS", "tap", "LoginTest", "testTap", "0"]
        );
    }

    #[test]
    fn test_read_arguments() {
        let stream = MockStream::new().data("tap\nLoginTest\ntestTap\n9\n");
        let mut codec = FrameCodec::new(stream, fast());
        let request = codec.read_arguments(None).unwrap();
        assert_eq!(
            request,
            ScreenshotRequest::new("tap", "LoginTest", "testTap", Orientation::ReversePortrait)
        );
    }

    #[test]
    fn test_partial_writes_complete() {
        let mut codec = FrameCodec::new(MockStream::new().trickle(2), fast());
        codec.write_command(Command::CaptureDone).unwrap();
        assert_eq!(codec.get_ref().written(), b"CAPTURE_DONE\n");
    }

    #[test]
    fn test_stalled_write_times_out() {
        let mut codec = FrameCodec::new(MockStream::new().stalled(), fast());
        let err = codec.write_command(Command::Start).unwrap_err();
        assert!(matches!(err, ProtocolError::WriteTimeout(5)));
        assert!(err.is_timeout());
        assert_eq!(codec.get_ref().write_attempts(), 5);
    }

    #[test]
    fn test_write_rejects_embedded_newline() {
        let mut codec = FrameCodec::new(MockStream::new(), fast());
        codec.write_line("START\nCAPTURE").unwrap_err();
        assert!(codec.get_ref().written().is_empty());
    }
}
