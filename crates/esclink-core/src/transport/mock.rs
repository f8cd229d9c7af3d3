//! Mock transport for testing.
//!
//! Captures every write and serves queued bytes on read. An optional
//! responder closure plays the device: it sees each written frame and
//! returns the frames to queue in reply.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::traits::{Transport, TransportError};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// How long an empty read blocks before reporting a timeout.
const EMPTY_READ_DELAY: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock transport for unit testing codec and session logic.
#[derive(Clone)]
pub struct MockTransport {
    /// Chunks returned by `read`, in order.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    responder: Arc<Mutex<Option<Responder>>>,
    /// Whether the port is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue bytes to be returned by a later read.
    pub fn queue_read(&self, bytes: &[u8]) {
        lock(&self.read_queue).push_back(bytes.to_vec());
    }

    /// Install a device double that answers each write.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Simulate port loss.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.write_log).push(data.to_vec());

        let replies = match lock(&self.responder).as_mut() {
            Some(respond) => respond(data),
            None => Vec::new(),
        };
        lock(&self.read_queue).extend(replies);
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let chunk = {
            let mut queue = lock(&self.read_queue);
            match queue.pop_front() {
                Some(mut chunk) if chunk.len() > max_len.max(1) => {
                    let rest = chunk.split_off(max_len.max(1));
                    queue.push_front(rest);
                    Some(chunk)
                }
                other => other,
            }
        };
        match chunk {
            Some(chunk) => Ok(chunk),
            None => {
                thread::sleep(EMPTY_READ_DELAY);
                Err(TransportError::Timeout {
                    timeout_ms: EMPTY_READ_DELAY.as_millis() as u64,
                })
            }
        }
    }

    fn clear_input(&self) -> Result<(), TransportError> {
        lock(&self.read_queue).clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_read_queue() {
        let mock = MockTransport::new();
        mock.queue_read(b"abc");
        mock.queue_read(b"de");

        assert_eq!(mock.read(2).unwrap(), b"ab");
        assert_eq!(mock.read(16).unwrap(), b"c");
        assert_eq!(mock.read(16).unwrap(), b"de");

        // Queue is empty now
        assert!(matches!(mock.read(16), Err(TransportError::Timeout { .. })));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");

        mock.clear_writes();
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_mock_responder() {
        let mock = MockTransport::new();
        mock.set_responder(|data| vec![data.iter().rev().copied().collect()]);
        mock.write(b"ping").unwrap();
        assert_eq!(mock.read(64).unwrap(), b"gnip");
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(b"test").is_err());
        assert!(matches!(mock.read(1), Err(TransportError::Disconnected)));

        mock.reconnect();
        assert!(mock.write(b"test").is_ok());
    }
}
