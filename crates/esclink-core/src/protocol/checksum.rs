//! Frame checksums.
//!
//! Two algorithms are supported on the wire: CRC16/MODBUS (two bytes,
//! little-endian) and an 8-bit additive sum. `None` disables the trailer.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a configuration names an unknown algorithm.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown checksum algorithm: {0}")]
pub struct UnknownChecksum(pub String);

/// Checksum algorithm appended to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumAlgo {
    #[default]
    Crc16Modbus,
    Sum8,
    None,
}

impl ChecksumAlgo {
    /// Number of trailer bytes this algorithm produces.
    pub fn len(self) -> usize {
        match self {
            ChecksumAlgo::Crc16Modbus => 2,
            ChecksumAlgo::Sum8 => 1,
            ChecksumAlgo::None => 0,
        }
    }

    /// Whether frames carry no checksum at all.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgo::Crc16Modbus => "CRC16_MODBUS",
            ChecksumAlgo::Sum8 => "SUM8",
            ChecksumAlgo::None => "NONE",
        }
    }
}

impl fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgo {
    type Err = UnknownChecksum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRC16_MODBUS" => Ok(ChecksumAlgo::Crc16Modbus),
            "SUM8" => Ok(ChecksumAlgo::Sum8),
            "NONE" => Ok(ChecksumAlgo::None),
            _ => Err(UnknownChecksum(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChecksumAlgo {
    type Error = UnknownChecksum;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChecksumAlgo> for String {
    fn from(algo: ChecksumAlgo) -> Self {
        algo.as_str().to_string()
    }
}

/// CRC16/MODBUS: init 0xFFFF, reflected polynomial 0xA001.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Sum of all bytes modulo 256.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Checksum trailer for `payload` as it appears on the wire.
pub fn checksum_bytes(payload: &[u8], algo: ChecksumAlgo) -> Vec<u8> {
    match algo {
        ChecksumAlgo::Crc16Modbus => {
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, crc16_modbus(payload));
            buf.to_vec()
        }
        ChecksumAlgo::Sum8 => vec![sum8(payload)],
        ChecksumAlgo::None => Vec::new(),
    }
}

/// Integer value of checksum trailer bytes (little-endian).
///
/// This is the quantity added into the flash integrity accumulator.
pub fn checksum_value(bytes: &[u8]) -> u16 {
    match bytes.len() {
        0 => 0,
        1 => bytes[0] as u16,
        _ => LittleEndian::read_u16(&bytes[..2]),
    }
}
