//! Byte-channel abstraction used by the response correlator.
//!
//! A device link is split into two halves: a [`MessageSink`] written from
//! foreground callers and a [`MessageSource`] owned by the correlator's
//! receiver thread. Splitting keeps the blocking read off every caller's path
//! and lets each half be owned by exactly one thread.

use std::io::{ErrorKind, Read};

use crate::error::{AppResult, ScopeError};

/// Write half of a device link.
pub trait MessageSink: Send {
    /// Write one complete message (including any terminator the protocol needs).
    fn send(&mut self, message: &[u8]) -> AppResult<()>;
}

/// Read half of a device link.
pub trait MessageSource: Send {
    /// Block until a full message is available.
    ///
    /// Returns `Ok(None)` when the underlying read timed out without completing
    /// a message, so the caller can check whether it should keep running.
    fn receive(&mut self) -> AppResult<Option<String>>;

    /// Human-readable name for logs and thread names.
    fn name(&self) -> String {
        "message-source".to_string()
    }
}

/// Longest message accepted by default, terminator excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Splits a byte stream into terminator-delimited ASCII messages.
///
/// Bytes read past a terminator are retained for the next call, and a
/// terminator split across two reads is still recognised. Unterminated input
/// longer than the frame limit is dropped with a protocol error.
#[derive(Debug)]
pub struct TerminatorFramer<R> {
    reader: R,
    terminator: Vec<u8>,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    max_frame_len: usize,
}

impl<R: Read> TerminatorFramer<R> {
    /// Framer reading from `reader`, with [`DEFAULT_MAX_FRAME_LEN`].
    pub fn new(reader: R, terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            reader,
            terminator: terminator.into(),
            buffer: Vec::with_capacity(64),
            chunk: vec![0u8; 256],
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Replace the frame limit.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// The message terminator.
    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    /// The underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Bytes received but not yet part of a complete message.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Return the next complete message, reading as needed.
    ///
    /// A read timeout (or a zero-length read) ends the call with `Ok(None)`;
    /// the partial message stays buffered.
    pub fn next_message(&mut self) -> AppResult<Option<String>> {
        loop {
            if let Some(message) = self.take_buffered()? {
                return Ok(Some(message));
            }

            match self.reader.read(&mut self.chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buffer.extend_from_slice(&self.chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_buffered(&mut self) -> AppResult<Option<String>> {
        let tl = self.terminator.len();
        if tl == 0 || self.buffer.len() < tl {
            return Ok(None);
        }
        let Some(end) = self
            .buffer
            .windows(tl)
            .position(|window| window == self.terminator.as_slice())
        else {
            // a terminator may still be arriving in the last tl - 1 bytes
            if self.buffer.len() > self.max_frame_len + tl - 1 {
                let dropped = self.buffer.len();
                self.buffer.clear();
                return Err(ScopeError::Protocol(format!(
                    "no terminator within {} bytes; dropped {dropped} bytes",
                    self.max_frame_len
                )));
            }
            return Ok(None);
        };
        if end > self.max_frame_len {
            self.buffer.drain(..end + tl);
            return Err(ScopeError::Protocol(format!(
                "message of {end} bytes exceeds the {} byte limit",
                self.max_frame_len
            )));
        }

        let frame: Vec<u8> = self.buffer.drain(..end + tl).take(end).collect();
        if !frame.is_ascii() {
            return Err(ScopeError::Protocol(format!(
                "non-ASCII message from device: {:?}",
                String::from_utf8_lossy(&frame)
            )));
        }
        // ASCII is valid UTF-8
        Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
    }
}
