//! Intel-HEX record decoding.

use std::fmt;

use thiserror::Error;

/// Per-line decoding failure; the image parser adds the line number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("checksum mismatch (calculated {calculated:02X}, found {found:02X})")]
    Checksum { calculated: u8, found: u8 },

    #[error("invalid hex digits")]
    InvalidHex,

    #[error("odd number of hex digits")]
    OddLength,

    #[error("record truncated: {actual} hex digits, expected {expected}")]
    Truncated { expected: usize, actual: usize },
}

/// Intel-HEX record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x03 => RecordType::StartSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            0x05 => RecordType::StartLinearAddress,
            other => RecordType::Unknown(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Data => write!(f, "DATA"),
            RecordType::EndOfFile => write!(f, "EOF"),
            RecordType::ExtendedSegmentAddress => write!(f, "EXT_SEGMENT"),
            RecordType::StartSegmentAddress => write!(f, "START_SEGMENT"),
            RecordType::ExtendedLinearAddress => write!(f, "EXT_LINEAR"),
            RecordType::StartLinearAddress => write!(f, "START_LINEAR"),
            RecordType::Unknown(t) => write!(f, "UNKNOWN({:02X})", t),
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Absolute address (extended base + 16-bit offset).
    pub address: u32,
    pub record_type: RecordType,
    pub data: Vec<u8>,
}

/// Decode a record line without its leading `:`.
///
/// Spaces are ignored. The checksum is the two's complement of the sum of
/// every preceding byte.
pub fn parse_line(text: &str, extended_address: u32) -> Result<HexRecord, RecordError> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(RecordError::InvalidHex);
    }
    if digits.len() % 2 != 0 {
        return Err(RecordError::OddLength);
    }

    let bytes: Vec<u8> = digits
        .chunks_exact(2)
        .map(|pair| (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]))
        .collect();

    // count(1) + address(2) + type(1) + checksum(1)
    if bytes.len() < 5 {
        return Err(RecordError::Truncated {
            expected: 10,
            actual: digits.len(),
        });
    }
    let byte_count = bytes[0] as usize;
    let expected_len = 5 + byte_count;
    if bytes.len() < expected_len {
        return Err(RecordError::Truncated {
            expected: expected_len * 2,
            actual: digits.len(),
        });
    }

    let body = &bytes[..4 + byte_count];
    let found = bytes[4 + byte_count];
    let calculated = body
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg();
    if calculated != found {
        return Err(RecordError::Checksum { calculated, found });
    }

    let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
    Ok(HexRecord {
        address: extended_address.wrapping_add(offset),
        record_type: RecordType::from(bytes[3]),
        data: bytes[4..4 + byte_count].to_vec(),
    })
}

fn hex_nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}
