//! Serial port transport
//!
//! Wraps the `serialport` crate. The port is opened once and cloned so that the
//! correlator's receiver thread owns the read half while foreground callers
//! write through the other.

use std::io::Write;

use serialport::SerialPort;
use tracing::{debug, trace};

use crate::config::StandConfig;
use crate::error::AppResult;
use crate::messaging::transport::{MessageSink, MessageSource, TerminatorFramer};

/// Write half of an open serial port.
pub struct SerialSink {
    port: Box<dyn SerialPort>,
}

/// Read half of an open serial port, framing on a fixed terminator.
pub struct SerialSource {
    port_name: String,
    framer: TerminatorFramer<Box<dyn SerialPort>>,
}

/// Open `config.port` and split it into sink and source halves.
///
/// `terminator` ends each response (the Leica stand uses `\r`). The read
/// timeout bounds how long the receiver blocks before it can observe shutdown.
pub fn open(config: &StandConfig, terminator: &[u8]) -> AppResult<(SerialSink, SerialSource)> {
    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(config.read_timeout())
        .open()?;
    let reader = port.try_clone()?;

    debug!(
        "Serial port '{}' opened at {} baud",
        config.port, config.baud_rate
    );

    Ok((
        SerialSink { port },
        SerialSource {
            port_name: config.port.clone(),
            framer: TerminatorFramer::new(reader, terminator.to_vec()),
        },
    ))
}

impl MessageSink for SerialSink {
    fn send(&mut self, message: &[u8]) -> AppResult<()> {
        self.port.write_all(message)?;
        self.port.flush()?;
        trace!("Sent serial message: {:?}", String::from_utf8_lossy(message));
        Ok(())
    }
}

impl MessageSource for SerialSource {
    fn receive(&mut self) -> AppResult<Option<String>> {
        self.framer.next_message()
    }

    fn name(&self) -> String {
        format!("serial({})", self.port_name)
    }
}
