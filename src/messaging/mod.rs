//! Asynchronous device messaging
//!
//! Devices on a serial link may answer out of order and interleave unsolicited
//! status notifications with command responses. This module turns such a link
//! into callback-based request/response plumbing:
//!
//! - [`transport`]: sink/source halves of a link and terminator framing
//! - [`strategy`]: how a response maps to the key its callback waits on
//! - [`correlator`]: the background receiver and pending-callback tables

pub mod correlator;
pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;
pub mod strategy;
pub mod transport;

pub use correlator::{Registration, ResponseCallback, ResponseCorrelator};
pub use strategy::{EchoStrategy, KeyStrategy, LeicaStrategy, ResponseKey};
pub use transport::{MessageSink, MessageSource, TerminatorFramer};
