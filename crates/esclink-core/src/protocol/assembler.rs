//! Byte-stream to frame reassembly.
//!
//! The link is half-duplex on some adapters, so the host's own frames may be
//! echoed back. Frames starting with the host start character are skipped;
//! frames starting with the device start character are collected up to the
//! terminator plus the checksum trailer. The configured preamble is
//! re-attached when it immediately preceded the start character.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::constants::{CMD_REPLY, MAX_FRAME_PAYLOAD, PAYLOAD_TERMINATOR, REPLY_PREFIX};
use crate::config::ProtocolConfig;

#[derive(Debug)]
enum Mode {
    /// Between frames.
    Idle,
    /// Skipping an echoed host frame; `trailer` counts checksum bytes once
    /// the terminator was seen.
    Echo { trailer: Option<usize> },
    /// Collecting a device payload.
    Payload { raw_remaining: usize },
    /// Collecting the checksum trailer.
    Trailer { remaining: usize },
}

/// Incremental frame reassembler. Feed bytes with [`push`](Self::push).
#[derive(Debug)]
pub struct FrameAssembler {
    preamble: Vec<u8>,
    tx_start: u8,
    rx_start: u8,
    checksum_len: usize,
    /// `{rx}HEX:REPLY` and `{rx}REPLY:`; a raw checksum field follows
    /// either.
    raw_prefixes: [Vec<u8>; 2],
    /// Last bytes seen outside a frame, for preamble detection.
    recent: VecDeque<u8>,
    buf: Vec<u8>,
    with_preamble: bool,
    mode: Mode,
}

impl FrameAssembler {
    pub fn new(cfg: &ProtocolConfig) -> Self {
        let raw_prefix = |keyword: &str| {
            let mut prefix = vec![cfg.rx_start];
            prefix.extend_from_slice(keyword.as_bytes());
            prefix
        };
        Self {
            preamble: cfg.preamble.clone(),
            tx_start: cfg.tx_start,
            rx_start: cfg.rx_start,
            checksum_len: cfg.checksum_len(),
            raw_prefixes: [raw_prefix(REPLY_PREFIX), raw_prefix(CMD_REPLY)],
            recent: VecDeque::with_capacity(cfg.preamble.len()),
            buf: Vec::new(),
            with_preamble: false,
            mode: Mode::Idle,
        }
    }

    /// Discard any partially collected frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.recent.clear();
        self.mode = Mode::Idle;
    }

    /// Feed a slice, returning every frame completed by it.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Feed one byte. Returns a whole frame when this byte completes one.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.mode {
            Mode::Idle => {
                if byte == self.tx_start {
                    trace!("Skipping echoed host frame");
                    self.recent.clear();
                    self.mode = Mode::Echo { trailer: None };
                } else if byte == self.rx_start {
                    self.with_preamble = !self.preamble.is_empty()
                        && self.recent.iter().copied().eq(self.preamble.iter().copied());
                    self.recent.clear();
                    self.buf.clear();
                    self.buf.push(byte);
                    self.mode = Mode::Payload { raw_remaining: 0 };
                } else if !self.preamble.is_empty() {
                    if self.recent.len() == self.preamble.len() {
                        self.recent.pop_front();
                    }
                    self.recent.push_back(byte);
                }
                None
            }
            Mode::Echo { trailer: None } => {
                if byte == PAYLOAD_TERMINATOR {
                    self.mode = if self.checksum_len == 0 {
                        Mode::Idle
                    } else {
                        Mode::Echo {
                            trailer: Some(self.checksum_len),
                        }
                    };
                }
                None
            }
            Mode::Echo {
                trailer: Some(remaining),
            } => {
                self.mode = if remaining <= 1 {
                    Mode::Idle
                } else {
                    Mode::Echo {
                        trailer: Some(remaining - 1),
                    }
                };
                None
            }
            Mode::Payload { raw_remaining } => {
                self.buf.push(byte);
                if raw_remaining > 0 {
                    self.mode = Mode::Payload {
                        raw_remaining: raw_remaining - 1,
                    };
                } else if byte == PAYLOAD_TERMINATOR {
                    if self.checksum_len == 0 {
                        return Some(self.finish());
                    }
                    self.mode = Mode::Trailer {
                        remaining: self.checksum_len,
                    };
                } else if self.raw_prefixes.iter().any(|p| *p == self.buf) {
                    self.mode = Mode::Payload {
                        raw_remaining: self.checksum_len,
                    };
                }
                if self.buf.len() > MAX_FRAME_PAYLOAD {
                    debug!(len = self.buf.len(), "Dropping over-long frame");
                    self.reset();
                }
                None
            }
            Mode::Trailer { remaining } => {
                self.buf.push(byte);
                if remaining <= 1 {
                    return Some(self.finish());
                }
                self.mode = Mode::Trailer {
                    remaining: remaining - 1,
                };
                None
            }
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.preamble.len() + self.buf.len());
        if self.with_preamble {
            frame.extend_from_slice(&self.preamble);
        }
        frame.append(&mut self.buf);
        self.mode = Mode::Idle;
        frame
    }
}
