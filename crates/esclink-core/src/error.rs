//! Error taxonomy shared by the codecs and the flash session.
//!
//! Each layer has its own `thiserror` enum; `ErrorKind` flattens them into
//! the categories reported to the operator and counted in diagnostics.

use std::fmt;

use thiserror::Error;

use crate::hex::HexError;
use crate::state::machine::Stage;
use crate::transport::TransportError;

/// Flat error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ChecksumMismatch,
    FrameTooShort,
    FormatError,
    DataMismatch,
    TimeoutExceeded,
    ConsecutiveErrorLimitExceeded,
    UserAborted,
    HexParseError,
    BoundsViolation,
    InvalidValue,
    EmptyImage,
    Transport,
    NoResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ChecksumMismatch => "CRC_MISMATCH",
            ErrorKind::FrameTooShort => "FRAME_TOO_SHORT",
            ErrorKind::FormatError => "FORMAT_ERROR",
            ErrorKind::DataMismatch => "DATA_MISMATCH",
            ErrorKind::TimeoutExceeded => "TIMEOUT",
            ErrorKind::ConsecutiveErrorLimitExceeded => "CONSECUTIVE_ERRORS",
            ErrorKind::UserAborted => "USER_ABORTED",
            ErrorKind::HexParseError => "HEX_PARSE_ERROR",
            ErrorKind::BoundsViolation => "BOUNDS_VIOLATION",
            ErrorKind::InvalidValue => "INVALID_VALUE",
            ErrorKind::EmptyImage => "EMPTY_IMAGE",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::NoResponse => "NO_RESPONSE",
        };
        f.write_str(name)
    }
}

/// Kind of a reply that failed validation during flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Frame-level checksum failure (or a frame too short to check).
    CrcMismatch,
    /// Reply does not have the structure the stage expects.
    FormatError,
    /// Well-formed reply carrying the wrong value.
    DataMismatch,
}

impl FaultKind {
    pub fn error_kind(self) -> ErrorKind {
        match self {
            FaultKind::CrcMismatch => ErrorKind::ChecksumMismatch,
            FaultKind::FormatError => ErrorKind::FormatError,
            FaultKind::DataMismatch => ErrorKind::DataMismatch,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_kind().fmt(f)
    }
}

/// One rejected reply, with what was expected and what arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFault {
    pub stage: Stage,
    pub kind: FaultKind,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} during {}: expected {}, actual {}",
            self.kind, self.stage, self.expected, self.actual
        )
    }
}

/// Running fault counters, kept even when the fault was retried away.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorStats {
    pub crc: u32,
    pub format: u32,
    pub data: u32,
    pub total: u32,
}

impl ErrorStats {
    pub fn record(&mut self, kind: FaultKind) {
        match kind {
            FaultKind::CrcMismatch => self.crc += 1,
            FaultKind::FormatError => self.format += 1,
            FaultKind::DataMismatch => self.data += 1,
        }
        self.total += 1;
    }
}

impl fmt::Display for ErrorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CRC={} FORMAT={} DATA={} TOTAL={}",
            self.crc, self.format, self.data, self.total
        )
    }
}

fn fault_suffix(fault: &Option<ProtocolFault>) -> String {
    match fault {
        Some(fault) => format!(", last fault: {}", fault),
        None => String::new(),
    }
}

/// Terminal failure of a flash session.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("{stage} timed out after {elapsed_ms}ms")]
    TimeoutExceeded { stage: Stage, elapsed_ms: u64 },

    #[error("{stage} failed after {attempts} attempts{}", fault_suffix(.last_fault))]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        last_fault: Option<ProtocolFault>,
    },

    #[error("{stage} failed after {count} consecutive errors{}", fault_suffix(.last_fault))]
    ConsecutiveErrorLimitExceeded {
        stage: Stage,
        count: u32,
        last_fault: Option<ProtocolFault>,
    },

    #[error("Aborted by user")]
    UserAborted,

    #[error("Firmware image contains no data")]
    EmptyImage,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid firmware image: {0}")]
    Hex(#[from] HexError),
}

impl FlashError {
    /// Terminal category of the failure that ended the session.
    ///
    /// Fault-driven failures report the limit that was hit, not the fault;
    /// the fault's own kind is `last_fault().map(|f| f.kind.error_kind())`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::TimeoutExceeded { .. } | FlashError::RetriesExhausted { .. } => {
                ErrorKind::TimeoutExceeded
            }
            FlashError::ConsecutiveErrorLimitExceeded { .. } => {
                ErrorKind::ConsecutiveErrorLimitExceeded
            }
            FlashError::UserAborted => ErrorKind::UserAborted,
            FlashError::EmptyImage => ErrorKind::EmptyImage,
            FlashError::Transport(_) => ErrorKind::Transport,
            FlashError::Hex(_) => ErrorKind::HexParseError,
        }
    }

    /// The last rejected reply, when the failure was caused by faults.
    pub fn last_fault(&self) -> Option<&ProtocolFault> {
        match self {
            FlashError::RetriesExhausted { last_fault, .. }
            | FlashError::ConsecutiveErrorLimitExceeded { last_fault, .. } => last_fault.as_ref(),
            _ => None,
        }
    }

    /// Stage the session was in when it failed, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FlashError::TimeoutExceeded { stage, .. }
            | FlashError::RetriesExhausted { stage, .. }
            | FlashError::ConsecutiveErrorLimitExceeded { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
