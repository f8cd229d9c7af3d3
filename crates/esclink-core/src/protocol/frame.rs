//! Base frame codec: `preamble ++ payload ++ checksum(payload)`.
//!
//! The preamble is never covered by the checksum. Parsing splits the frame
//! by fixed offsets derived from the configuration.

use thiserror::Error;

use super::checksum::{ChecksumAlgo, checksum_bytes};
use crate::config::ProtocolConfig;
use crate::error::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes, need at least {minimum}")]
    TooShort { actual: usize, minimum: usize },

    #[error(
        "Checksum mismatch: expected {}, got {}",
        hex_upper(.expected),
        hex_upper(.actual)
    )]
    ChecksumMismatch { expected: Vec<u8>, actual: Vec<u8> },
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::TooShort { .. } => ErrorKind::FrameTooShort,
            FrameError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
        }
    }
}

/// Build a wire frame around `payload`.
pub fn build_frame(payload: &[u8], cfg: &ProtocolConfig) -> Vec<u8> {
    let trailer = checksum_bytes(payload, cfg.checksum);
    let mut frame = Vec::with_capacity(cfg.preamble.len() + payload.len() + trailer.len());
    frame.extend_from_slice(&cfg.preamble);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&trailer);
    frame
}

/// Validate a received frame and return its bare payload.
pub fn parse_frame<'a>(frame: &'a [u8], cfg: &ProtocolConfig) -> Result<&'a [u8], FrameError> {
    let pre_len = cfg.preamble.len();
    let cs_len = cfg.checksum.len();
    let minimum = pre_len + 1 + cs_len;
    if frame.len() < minimum {
        return Err(FrameError::TooShort {
            actual: frame.len(),
            minimum,
        });
    }

    let payload = &frame[pre_len..frame.len() - cs_len];
    let received = &frame[frame.len() - cs_len..];
    let expected = checksum_bytes(payload, cfg.checksum);
    if expected != received {
        return Err(FrameError::ChecksumMismatch {
            expected,
            actual: received.to_vec(),
        });
    }
    Ok(payload)
}

/// Trailing checksum bytes of a frame built with `algo`.
pub fn frame_checksum(frame: &[u8], algo: ChecksumAlgo) -> &[u8] {
    let cs_len = algo.len().min(frame.len());
    &frame[frame.len() - cs_len..]
}

/// Uppercase hex without separators, e.g. `37 4B` -> `"374B"`.
pub fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
