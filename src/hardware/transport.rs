use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port {port} unavailable: {message}")]
    PortUnavailable { port: String, message: String },
    #[error("permission denied opening {port}")]
    PermissionDenied { port: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a line")]
    Timeout,
    #[error("port is closed")]
    Closed,
}

/// Byte-level ownership of the serial device. Implementations never
/// interpret line content; that is the codec's job.
pub trait Transport: Send {
    /// Read one newline-terminated line, blocking up to `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;
    /// Write `text` plus a newline and flush immediately.
    fn write_line(&mut self, text: &str) -> Result<(), TransportError>;
    /// Drop any unread input (stale boot messages, late responses).
    fn clear_input(&mut self) -> Result<(), TransportError>;
    /// Idempotent; safe from cleanup paths.
    fn close(&mut self);
}

/// The transport handle is shared between the dispatcher, the connection
/// manager and the drain task; the mutex is held for one full dispatcher
/// attempt (write plus all response reads). `None` means not connected.
pub type SharedTransport = Arc<Mutex<Option<Box<dyn Transport>>>>;

pub fn shared_transport() -> SharedTransport {
    Arc::new(Mutex::new(None))
}

/// Real serial device, 8N1 framing.
pub struct SerialTransport {
    reader: Option<BufReader<Box<dyn serialport::SerialPort>>>,
    port_name: String,
}

impl SerialTransport {
    pub fn open(port: &str, baudrate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let handle = serialport::new(port, baudrate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied { port: port.to_string() }
                }
                _ => TransportError::PortUnavailable {
                    port: port.to_string(),
                    message: e.to_string(),
                },
            })?;
        debug!("opened {} at {} baud", port, baudrate);
        Ok(Self {
            reader: Some(BufReader::new(handle)),
            port_name: port.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        reader
            .get_mut()
            .set_timeout(timeout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => Err(TransportError::Closed),
            Ok(_) => Ok(line.trim_end().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            // Non-UTF-8 bytes read as garbage rather than a hard failure; the
            // codec discards what it cannot anchor on POS.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let port = reader.get_mut();
        port.write_all(text.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        reader
            .get_mut()
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        // Also drop anything the BufReader already pulled off the wire.
        let buffered = reader.buffer().len();
        reader.consume(buffered);
        Ok(())
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("closed {}", self.port_name);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
