//! Serial session helper.
//!
//! Firmware images and the bootloader both speak a line-oriented text
//! protocol over USB CDC. This module provides the small amount of transport
//! the harness needs: open a port, write a literal command, read what came
//! back, or keep reading until some banner text shows up.
//!
//! ```text
//! +------------------+
//! |  SerialSession   |  send_command / wait_for
//! +--------+---------+
//!          |
//! +--------+---------+
//! |    Port trait    |  Read + Write + timeouts
//! +--------+---------+
//!          |
//! +--------+---------+
//! |   NativePort     |  serialport crate
//! +------------------+
//! ```

use crate::error::{Error, Result};
use crate::poll::{Clock, poll_until};
use log::{debug, trace};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Pause between reads while waiting for text.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Largest single read.
const READ_CHUNK: usize = 1024;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate. CDC-ACM ignores it but the OS still wants one.
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Configuration for `port_name` at 115200 8N1.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte stream to a device.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Bytes waiting in the receive buffer.
    fn bytes_to_read(&self) -> Result<u32>;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port name/path.
    fn name(&self) -> &str;
}

/// Opens ports by configuration.
pub trait PortOpener: Send + Sync {
    /// Open the port named in `config`.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

/// Port backed by the `serialport` crate.
#[cfg(feature = "native")]
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
}

#[cfg(feature = "native")]
impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }
}

#[cfg(feature = "native")]
impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok(self.port.bytes_to_read()?)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(feature = "native")]
impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

#[cfg(feature = "native")]
impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// Opens [`NativePort`]s.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

#[cfg(feature = "native")]
impl PortOpener for NativeOpener {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        Ok(Box::new(NativePort::open(config)?))
    }
}

/// Decode as much of `buffer` as possible, replacing invalid sequences with
/// U+FFFD and keeping a trailing incomplete sequence for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                output.push_str(&String::from_utf8_lossy(&buffer[..valid_up_to]));

                if let Some(invalid_len) = err.error_len() {
                    output.push(char::REPLACEMENT_CHARACTER);
                    buffer.drain(..(valid_up_to + invalid_len).min(buffer.len()));
                } else {
                    buffer.drain(..valid_up_to);
                    break;
                }
            },
        }
    }

    output
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// An open serial connection. The port is closed when the session drops.
pub struct SerialSession {
    port: Box<dyn Port>,
    clock: Arc<dyn Clock>,
    pending: Vec<u8>,
}

impl SerialSession {
    /// Open `config` through `opener`.
    pub fn open(opener: &dyn PortOpener, config: &SerialConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        debug!("Opening {}", config.port_name);
        Ok(Self::from_port(opener.open(config)?, clock))
    }

    /// Wrap an already open port.
    pub fn from_port(port: Box<dyn Port>, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            clock,
            pending: Vec::new(),
        }
    }

    /// Port name/path.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Write `command` followed by CR LF, wait `settle`, and return whatever
    /// the device sent back in that time.
    pub fn send_command(&mut self, command: &str, settle: Duration) -> Result<String> {
        self.write_line(command)?;
        self.clock.sleep(settle);
        let reply = self.read_available()?;
        trace!("{} -> {reply:?}", self.port.name());
        Ok(reply)
    }

    /// Write `command` followed by CR LF without reading anything back.
    pub fn write_line(&mut self, command: &str) -> Result<()> {
        trace!("{} <- {command:?}", self.port.name());
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\r\n")?;
        self.port.flush()?;
        Ok(())
    }

    /// Read everything currently buffered, without waiting for more.
    pub fn read_available(&mut self) -> Result<String> {
        let mut text = String::new();
        while self.read_chunk()? > 0 {
            text.push_str(&drain_utf8_lossy(&mut self.pending));
        }
        Ok(text)
    }

    /// Keep reading until `expected` appears, returning all text read so far
    /// including the match.
    pub fn wait_for(&mut self, expected: &str, timeout: Duration) -> Result<String> {
        let clock = Arc::clone(&self.clock);
        let mut text = String::new();
        let what = format!("'{expected}' on {}", self.port.name());

        let found = poll_until(clock.as_ref(), READ_POLL_INTERVAL, timeout, &what, || {
            if self.read_chunk()? > 0 {
                text.push_str(&drain_utf8_lossy(&mut self.pending));
            }
            Ok(text.contains(expected).then(|| text.clone()))
        });

        match found {
            Err(Error::Timeout(_)) => Err(Error::Timeout(format!(
                "'{expected}' not seen on {} within {:.1}s (got {} bytes)",
                self.port.name(),
                timeout.as_secs_f64(),
                text.len()
            ))),
            other => other,
        }
    }

    /// One read of whatever is buffered (at least one byte is asked for, so a
    /// real port blocks up to its timeout). Returns the byte count.
    fn read_chunk(&mut self) -> Result<usize> {
        let waiting = (self.port.bytes_to_read()? as usize).clamp(1, READ_CHUNK);
        let mut buf = vec![0u8; waiting];
        match self.port.read(&mut buf) {
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(n)
            },
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MockOpener, MockPort};

    fn session(port: &MockPort, clock: &Arc<ManualClock>) -> SerialSession {
        SerialSession::from_port(Box::new(port.clone()), clock.clone())
    }

    #[test]
    fn test_drain_utf8_lossy_keeps_incomplete_tail() {
        let mut buffer = "Bank: 0 ".as_bytes().to_vec();
        buffer.extend_from_slice(&[0xE2, 0x9C]);
        assert_eq!(drain_utf8_lossy(&mut buffer), "Bank: 0 ");
        assert_eq!(buffer, vec![0xE2, 0x9C]);

        buffer.push(0x93);
        assert_eq!(drain_utf8_lossy(&mut buffer), "✓");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid() {
        let mut buffer = vec![b'o', b'k', 0xFF, b'!'];
        assert_eq!(drain_utf8_lossy(&mut buffer), "ok\u{FFFD}!");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_send_command_writes_crlf_and_reads_reply() {
        let clock = Arc::new(ManualClock::new());
        let port = MockPort::new("/dev/ttyACM0");
        port.reply_to("status\r\n", "Crispy Firmware Sample (C++)\r\nBank: 1\r\n");
        let mut session = session(&port, &clock);

        let reply = session
            .send_command("status", Duration::from_secs(1))
            .unwrap();

        assert_eq!(port.written(), b"status\r\n");
        assert!(reply.contains("Bank: 1"));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_accumulates_chunks() {
        let clock = Arc::new(ManualClock::new());
        let port = MockPort::new("/dev/ttyACM1").with_chunk_size(4);
        port.feed("boot...\r\nCrispy Firmware Sample (C++)\r\n");
        let mut session = session(&port, &clock);

        let text = session
            .wait_for("Crispy Firmware Sample (C++)", Duration::from_secs(10))
            .unwrap();
        assert!(text.starts_with("boot..."));
        assert!(text.contains("Crispy Firmware Sample (C++)"));
    }

    #[test]
    fn test_wait_for_times_out() {
        let clock = Arc::new(ManualClock::new());
        let port = MockPort::new("/dev/ttyACM1");
        port.feed("unrelated chatter\r\n");
        let mut session = session(&port, &clock);

        let err = session
            .wait_for("Crispy Firmware", Duration::from_secs(2))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("/dev/ttyACM1"));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_open_through_opener() {
        let clock = Arc::new(ManualClock::new());
        let opener = MockOpener::new();
        opener.insert(MockPort::new("/dev/ttyACM0"));

        let session = SerialSession::open(&opener, &SerialConfig::new("/dev/ttyACM0"), clock.clone()).unwrap();
        assert_eq!(session.name(), "/dev/ttyACM0");
        assert!(SerialSession::open(&opener, &SerialConfig::new("/dev/ttyACM9"), clock).is_err());
    }
}
