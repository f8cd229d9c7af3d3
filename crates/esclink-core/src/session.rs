//! Flash session - high-level orchestrator for one firmware download.
//!
//! The session owns an inbox. Frames from the background reader, debug
//! advance requests and aborts all arrive there, and the session thread
//! handles them one at a time together with the single pending timer.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::config::ProtocolConfig;
use crate::error::{ErrorStats, FlashError};
use crate::events::{FlashObserver, TracingObserver};
use crate::hex::HexImage;
use crate::state::handlers::{self, HandlerContext};
use crate::state::machine::{FlashContext, FlashOptions};
use crate::transport::{FrameReader, ReaderEvent, Transport, TransportError};

/// Everything the session thread reacts to besides its own timer.
#[derive(Debug)]
pub enum FlashInput {
    /// A complete frame from the device.
    Frame(Vec<u8>),
    /// The reader hit a transport error and stopped.
    ReaderFailed(TransportError),
    /// Debug mode: act as if the expected reply arrived.
    Advance,
    Abort,
}

impl From<ReaderEvent> for FlashInput {
    fn from(event: ReaderEvent) -> Self {
        match event {
            ReaderEvent::Frame(frame) => FlashInput::Frame(frame),
            ReaderEvent::Failed(e) => FlashInput::ReaderFailed(e),
        }
    }
}

/// Controls a running session from another thread.
#[derive(Clone)]
pub struct FlashHandle {
    sender: Sender<FlashInput>,
    abort_flag: Arc<AtomicBool>,
}

impl FlashHandle {
    /// Stop the session. Takes effect before any further input is handled.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
        let _ = self.sender.send(FlashInput::Abort);
    }

    /// Debug mode only: take the transition a successful reply would take.
    pub fn advance(&self) {
        let _ = self.sender.send(FlashInput::Advance);
    }
}

/// Summary of a successful flash.
#[derive(Debug, Clone)]
pub struct FlashReport {
    pub blocks: usize,
    pub bytes: usize,
    /// Integrity value confirmed by the device.
    pub accumulated: u16,
    /// Frame checksum of each acknowledged block.
    pub block_checksums: Vec<u16>,
    pub stats: ErrorStats,
    pub elapsed: Duration,
}

/// Flash session - drives the state machine over a transport.
pub struct FlashSession<O: FlashObserver> {
    protocol: ProtocolConfig,
    options: FlashOptions,
    observer: Arc<O>,
    sender: Sender<FlashInput>,
    inbox: Receiver<FlashInput>,
    abort_flag: Arc<AtomicBool>,
}

impl FlashSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(protocol: ProtocolConfig, options: FlashOptions) -> Self {
        Self::with_observer(protocol, options, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver + 'static> FlashSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(protocol: ProtocolConfig, options: FlashOptions, observer: Arc<O>) -> Self {
        let (sender, inbox) = mpsc::channel();
        Self {
            protocol,
            options,
            observer,
            sender,
            inbox,
            abort_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> FlashHandle {
        FlashHandle {
            sender: self.sender.clone(),
            abort_flag: self.abort_flag.clone(),
        }
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Load an Intel HEX file and flash it.
    pub fn flash_file<T, P>(&mut self, transport: Arc<T>, path: P) -> Result<FlashReport, FlashError>
    where
        T: Transport + ?Sized + 'static,
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading firmware image");
        let image = HexImage::from_file(path)?;
        self.run(transport, &image)
    }

    /// Flash `image`, blocking until SUCCESS or FAILED.
    #[instrument(skip_all, fields(port = transport.name()))]
    pub fn run<T>(&mut self, transport: Arc<T>, image: &HexImage) -> Result<FlashReport, FlashError>
    where
        T: Transport + ?Sized + 'static,
    {
        // Inputs left over from a previous run do not apply to this one.
        while self.inbox.try_recv().is_ok() {}
        self.abort_flag.store(false, Ordering::SeqCst);

        let blocks = image.data_blocks(self.options.block_size);
        info!(
            blocks = blocks.len(),
            bytes = image.data_len(),
            block_size = self.options.block_size,
            "Image loaded"
        );
        let mut state = FlashContext::new(blocks, self.options.debug_mode);

        transport.clear_input()?;
        let sender = self.sender.clone();
        let reader = FrameReader::spawn(transport.clone(), &self.protocol, move |event| {
            sender.send(event.into()).is_ok()
        })?;

        let started = Instant::now();
        self.drive(transport.as_ref(), &mut state);
        reader.stop();

        match state.outcome.take() {
            Some(Ok(())) => Ok(FlashReport {
                blocks: state.blocks.len(),
                bytes: state.total_bytes(),
                accumulated: state.accumulated,
                block_checksums: state.accepted_checksums,
                stats: state.stats,
                elapsed: started.elapsed(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(FlashError::UserAborted),
        }
    }

    /// Event loop: wait for the next input or the pending deadline.
    fn drive<T: Transport + ?Sized>(&self, transport: &T, state: &mut FlashContext) {
        let mut ctx = HandlerContext {
            transport,
            observer: self.observer.as_ref(),
            protocol: &self.protocol,
            timing: &self.options.timing,
            state,
        };

        handlers::start(&mut ctx, Instant::now());
        while !ctx.state.state.is_terminal() {
            if self.abort_flag.load(Ordering::SeqCst) {
                handlers::abort(&mut ctx);
                break;
            }

            let input = match ctx.state.deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.inbox.recv_timeout(wait) {
                        Ok(input) => Some(input),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.inbox.recv() {
                    Ok(input) => Some(input),
                    Err(_) => break,
                },
            };

            // An abort wins over whatever was dequeued with it.
            if self.abort_flag.load(Ordering::SeqCst) {
                handlers::abort(&mut ctx);
                break;
            }

            let now = Instant::now();
            let result = match input {
                None => handlers::handle_timer(&mut ctx, now),
                Some(FlashInput::Frame(frame)) => handlers::handle_frame(&mut ctx, &frame, now),
                Some(FlashInput::Advance) => handlers::advance(&mut ctx, now),
                Some(FlashInput::Abort) => handlers::abort(&mut ctx),
                Some(FlashInput::ReaderFailed(e)) => {
                    ctx.fail(FlashError::Transport(e));
                    handlers::HandleResult::Finished
                }
            };
            debug!(?result, state = %ctx.state.state, "Input handled");
        }
    }
}
