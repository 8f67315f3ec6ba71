//! In-process device link
//!
//! Provides a [`MessageSink`]/[`MessageSource`] pair connected to a
//! [`SimulatedDevice`] instead of hardware. Used by tests and for running the
//! device layer without a microscope attached.

use std::io::{self, ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{AppResult, ScopeError};
use crate::messaging::transport::{MessageSink, MessageSource, TerminatorFramer};

/// Host-side write half.
pub struct MemorySink {
    to_device: Sender<Vec<u8>>,
}

/// Host-side read half.
pub struct MemorySource {
    framer: TerminatorFramer<ChannelReader>,
}

/// The far end of an in-process link: sees what the host sent, injects replies.
pub struct SimulatedDevice {
    from_host: Receiver<Vec<u8>>,
    to_host: Sender<Vec<u8>>,
    terminator: Vec<u8>,
    unread: Vec<u8>,
}

/// Blocking `Read` over a channel of byte chunks, timing out like a serial port.
struct ChannelReader {
    chunks: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    read_timeout: Duration,
}

/// Create a linked host/device pair.
///
/// `read_timeout` plays the role of the serial port timeout: the source returns
/// `Ok(None)` after waiting this long without completing a message.
pub fn link(
    terminator: &[u8],
    read_timeout: Duration,
) -> (MemorySink, MemorySource, SimulatedDevice) {
    let (host_tx, device_rx) = mpsc::channel();
    let (device_tx, host_rx) = mpsc::channel();

    let reader = ChannelReader {
        chunks: host_rx,
        leftover: Vec::new(),
        read_timeout,
    };

    (
        MemorySink { to_device: host_tx },
        MemorySource {
            framer: TerminatorFramer::new(reader, terminator.to_vec()),
        },
        SimulatedDevice {
            from_host: device_rx,
            to_host: device_tx,
            terminator: terminator.to_vec(),
            unread: Vec::new(),
        },
    )
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.chunks.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.leftover = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(ErrorKind::BrokenPipe, "device end dropped"))
                }
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

impl MessageSink for MemorySink {
    fn send(&mut self, message: &[u8]) -> AppResult<()> {
        self.to_device
            .send(message.to_vec())
            .map_err(|_| ScopeError::Transport("simulated device disconnected".into()))
    }
}

impl MessageSource for MemorySource {
    fn receive(&mut self) -> AppResult<Option<String>> {
        self.framer.next_message()
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}

impl SimulatedDevice {
    /// Send a response to the host, appending the terminator.
    pub fn reply(&self, message: &str) -> AppResult<()> {
        let mut bytes = message.as_bytes().to_vec();
        bytes.extend_from_slice(&self.terminator);
        self.write_raw(bytes)
    }

    /// Send raw bytes to the host, e.g. to exercise partial frames.
    pub fn write_raw(&self, bytes: impl Into<Vec<u8>>) -> AppResult<()> {
        self.to_host
            .send(bytes.into())
            .map_err(|_| ScopeError::Transport("host end dropped".into()))
    }

    /// Next message the host sent, terminator stripped, if one arrives in time.
    pub fn next_sent(&mut self, timeout: Duration) -> Option<String> {
        self.poll_sent(timeout).ok().flatten()
    }

    /// Like `next_sent`, but `Err` once the host sink has been dropped.
    fn poll_sent(&mut self, timeout: Duration) -> Result<Option<String>, RecvTimeoutError> {
        loop {
            let tl = self.terminator.len();
            if let Some(end) = self
                .unread
                .windows(tl.max(1))
                .position(|w| w == self.terminator.as_slice())
            {
                let frame: Vec<u8> = self.unread.drain(..end + tl).take(end).collect();
                return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
            }
            match self.from_host.recv_timeout(timeout) {
                Ok(bytes) => self.unread.extend_from_slice(&bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Answer every host message on a background thread.
    ///
    /// `respond` maps one received message to zero or more replies. The thread
    /// exits when the host sink is dropped.
    pub fn spawn_responder<F>(mut self, mut respond: F) -> JoinHandle<()>
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        std::thread::spawn(move || {
            while let Ok(sent) = self.poll_sent(Duration::from_millis(50)) {
                let Some(message) = sent else { continue };
                for reply in respond(&message) {
                    if self.reply(&reply).is_err() {
                        return;
                    }
                }
            }
        })
    }
}
