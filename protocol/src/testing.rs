// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Scripted in-memory stream for driving sessions without sockets

use std::collections::VecDeque;
use std::io::{self, Read, Write};

#[derive(Debug)]
enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    AwaitWrite,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Accept,
    Stall,
    Trickle(usize),
}

/// Non-blocking stream double
///
/// Reads replay the scripted steps and report `WouldBlock` once the script
/// runs dry (end of stream is sticky). Writes are captured for inspection.
#[derive(Debug)]
pub struct MockStream {
    reads: VecDeque<ReadStep>,
    written: Vec<u8>,
    mode: WriteMode,
    write_attempts: usize,
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            written: Vec::new(),
            mode: WriteMode::Accept,
            write_attempts: 0,
        }
    }

    /// Queue bytes for the next read.
    pub fn data(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.reads.push_back(ReadStep::Data(bytes.as_ref().to_vec()));
        self
    }

    /// Queue one `WouldBlock` read.
    pub fn would_block(mut self) -> Self {
        self.reads.push_back(ReadStep::WouldBlock);
        self
    }

    /// Hold back the steps queued after this one until something has been
    /// written, the way a peer only answers once it is spoken to.
    pub fn after_write(mut self) -> Self {
        self.reads.push_back(ReadStep::AwaitWrite);
        self
    }

    /// Report end of stream once earlier steps are consumed.
    pub fn eof(mut self) -> Self {
        self.reads.push_back(ReadStep::Eof);
        self
    }

    /// Every write reports `WouldBlock`.
    pub fn stalled(mut self) -> Self {
        self.mode = WriteMode::Stall;
        self
    }

    /// Accept at most `n` bytes per write call.
    pub fn trickle(mut self, n: usize) -> Self {
        self.mode = WriteMode::Trickle(n);
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written)
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.front_mut() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::WouldBlock) => {
                self.reads.pop_front();
                Err(io::ErrorKind::WouldBlock.into())
            }
            Some(ReadStep::AwaitWrite) if self.written.is_empty() => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            Some(ReadStep::AwaitWrite) => {
                self.reads.pop_front();
                self.read(buf)
            }
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                data.drain(..n);
                if data.is_empty() {
                    self.reads.pop_front();
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_attempts += 1;
        let n = match self.mode {
            WriteMode::Accept => buf.len(),
            WriteMode::Stall => return Err(io::ErrorKind::WouldBlock.into()),
            WriteMode::Trickle(n) => n.min(buf.len()),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
