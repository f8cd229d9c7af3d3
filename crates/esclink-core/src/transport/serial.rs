//! Serial port transport built on `serialport`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort};
use tracing::{debug, info, instrument, trace};

use super::traits::{Transport, TransportError};
use crate::config::{Parity, ProtocolConfig, StopBits};

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

fn lock(port: &Mutex<Box<dyn SerialPort>>) -> MutexGuard<'_, Box<dyn SerialPort>> {
    port.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial port with independent read and write handles.
///
/// The reader thread blocks in `read` for up to the port timeout; writes go
/// through a cloned handle so they never wait on it.
pub struct SerialTransport {
    name: String,
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    timeout_ms: u64,
    connected: AtomicBool,
}

impl SerialTransport {
    /// Open `port` with 8 data bits and the link settings from `cfg`.
    #[instrument(skip(cfg), fields(baud = cfg.baud, parity = %cfg.parity))]
    pub fn open(port: &str, cfg: &ProtocolConfig) -> Result<Self, TransportError> {
        let timeout_ms = cfg.timeout_ms as u64;
        let writer = serialport::new(port, cfg.baud)
            .data_bits(DataBits::Eight)
            .parity(cfg.parity.into())
            .stop_bits(cfg.stop_bits.into())
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{}: {}", port, e)))?;
        let reader = writer
            .try_clone()
            .map_err(|e| TransportError::OpenFailed(format!("{}: {}", port, e)))?;

        info!(port, "Opened serial port");
        Ok(Self {
            name: port.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            timeout_ms,
            connected: AtomicBool::new(true),
        })
    }

    /// List serial ports present on the system.
    pub fn available_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }

    fn mark_lost(&self, e: &std::io::Error) {
        if matches!(
            e.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected
        ) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self, data), fields(port = %self.name, len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port = lock(&self.writer);
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| {
                self.mark_lost(&e);
                TransportError::WriteFailed(e.to_string())
            })?;
        trace!("Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len.max(1)];
        let mut port = lock(&self.reader);
        match port.read(&mut buf) {
            Ok(0) => Err(TransportError::Timeout {
                timeout_ms: self.timeout_ms,
            }),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: self.timeout_ms,
            }),
            Err(e) => {
                self.mark_lost(&e);
                Err(TransportError::ReadFailed(e.to_string()))
            }
        }
    }

    fn clear_input(&self) -> Result<(), TransportError> {
        lock(&self.reader)
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        debug!(port = %self.name, "Input buffer cleared");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!(port = %self.name, "Closing serial port");
    }
}
