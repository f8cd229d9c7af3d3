//! Background frame reader.
//!
//! Runs the transport read loop off the session thread, reassembles frames
//! and hands them to a sink. Stops when the sink refuses an event, when the
//! transport fails, or when [`FrameReader::stop`] is called.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::traits::{Transport, TransportError};
use crate::config::ProtocolConfig;
use crate::protocol::assembler::FrameAssembler;

const READ_CHUNK: usize = 256;

/// What the reader delivers.
#[derive(Debug)]
pub enum ReaderEvent {
    /// A complete frame, preamble and checksum included.
    Frame(Vec<u8>),
    /// The transport failed; the reader has stopped.
    Failed(TransportError),
}

pub struct FrameReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameReader {
    /// Spawn the read loop. `sink` returns `false` to stop reading.
    pub fn spawn<T, F>(
        transport: Arc<T>,
        cfg: &ProtocolConfig,
        mut sink: F,
    ) -> Result<Self, TransportError>
    where
        T: Transport + ?Sized + 'static,
        F: FnMut(ReaderEvent) -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let mut assembler = FrameAssembler::new(cfg);

        let handle = thread::Builder::new()
            .name("esclink-reader".into())
            .spawn(move || {
                debug!(port = transport.name(), "Reader started");
                while !stop_flag.load(Ordering::SeqCst) {
                    match transport.read(READ_CHUNK) {
                        Ok(bytes) => {
                            for frame in assembler.extend(&bytes) {
                                if !sink(ReaderEvent::Frame(frame)) {
                                    return;
                                }
                            }
                        }
                        Err(TransportError::Timeout { .. }) => continue,
                        Err(e) => {
                            if !stop_flag.load(Ordering::SeqCst) {
                                warn!(error = %e, "Reader stopped");
                                sink(ReaderEvent::Failed(e));
                            }
                            return;
                        }
                    }
                }
                debug!("Reader stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the loop to exit and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::build_frame;
    use crate::transport::MockTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_reader_delivers_frames() {
        let cfg = ProtocolConfig::default();
        let mock = Arc::new(MockTransport::new());
        let frame = build_frame(b"#HEX;", &cfg);
        mock.queue_read(&frame[..3]);
        mock.queue_read(&frame[3..]);

        let (tx, rx) = mpsc::channel();
        let reader = FrameReader::spawn(mock.clone(), &cfg, move |ev| tx.send(ev).is_ok()).unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ReaderEvent::Frame(got) => assert_eq!(got, frame),
            other => panic!("unexpected event: {:?}", other),
        }
        reader.stop();
    }

    #[test]
    fn test_reader_reports_disconnect() {
        let cfg = ProtocolConfig::default();
        let mock = Arc::new(MockTransport::new());
        let (tx, rx) = mpsc::channel();
        let _reader = FrameReader::spawn(mock.clone(), &cfg, move |ev| tx.send(ev).is_ok()).unwrap();
        mock.disconnect();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, ReaderEvent::Failed(TransportError::Disconnected)));
    }
}
