//! Byte transport abstraction.
//!
//! Defines the `Transport` trait consumed by the parameter client and the
//! flash session, allowing different implementations (serial, mock).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Port disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract byte-stream transport.
///
/// Methods take `&self` so one handle can be shared between the session
/// thread (writes) and the reader thread (reads). Dropping the transport
/// closes it.
pub trait Transport: Send + Sync {
    /// Write all of `data`, returning the number of bytes written.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes.
    ///
    /// Returns `TransportError::Timeout` when nothing arrived within the
    /// port timeout; callers treat that as "try again".
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Discard any bytes received but not yet read.
    fn clear_input(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Check if the port is still usable.
    fn is_connected(&self) -> bool;

    /// Port name for logs.
    fn name(&self) -> &str;
}
