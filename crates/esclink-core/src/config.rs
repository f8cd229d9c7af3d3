//! Protocol configuration.
//!
//! Loaded once from TOML and passed by value into every codec call and
//! session. Field names follow the device tool's configuration file
//! (`Preamble`, `Checksum`, `Baud`, ...); every field is optional.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::protocol::checksum::{ChecksumAlgo, UnknownChecksum};
use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid preamble hex string: {0:?}")]
    InvalidPreamble(String),

    #[error(transparent)]
    UnknownChecksum(#[from] UnknownChecksum),

    #[error("Invalid parity {0:?} (expected N, E or O)")]
    InvalidParity(String),

    #[error("Invalid stop bits {0:?} (expected 1 or 2)")]
    InvalidStopBits(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "N"),
            Parity::Even => write!(f, "E"),
            Parity::Odd => write!(f, "O"),
        }
    }
}

impl TryFrom<String> for Parity {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "E" | "EVEN" => Ok(Parity::Even),
            "O" | "ODD" => Ok(Parity::Odd),
            _ => Err(ConfigError::InvalidParity(value)),
        }
    }
}

impl From<Parity> for String {
    fn from(parity: Parity) -> Self {
        parity.to_string()
    }
}

/// Serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn count(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl Serialize for StopBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.count())
    }
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = NumberOrString::deserialize(deserializer)?.into_string();
        match raw.trim() {
            "1" => Ok(StopBits::One),
            "2" => Ok(StopBits::Two),
            _ => Err(serde::de::Error::custom(ConfigError::InvalidStopBits(raw))),
        }
    }
}

/// TOML files written by hand mix `StopBits = 1` and `StopBits = "1"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    Text(String),
}

impl NumberOrString {
    fn into_string(self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s,
        }
    }
}

/// Link and framing parameters shared by every exchange with the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bytes prepended to every frame, outside the checksum.
    #[serde(rename = "Preamble", with = "preamble_hex")]
    pub preamble: Vec<u8>,
    #[serde(rename = "Checksum")]
    pub checksum: ChecksumAlgo,
    #[serde(rename = "Baud")]
    pub baud: u32,
    #[serde(rename = "Parity")]
    pub parity: Parity,
    #[serde(rename = "StopBits")]
    pub stop_bits: StopBits,
    /// Port read timeout and parameter reply timeout.
    #[serde(rename = "Timeout")]
    pub timeout_ms: u32,
    /// First byte of host payloads.
    #[serde(rename = "TxStart", with = "start_char")]
    pub tx_start: u8,
    /// First byte of device payloads.
    #[serde(rename = "RxStart", with = "start_char")]
    pub rx_start: u8,
    /// Global override for the number of decimals in WRITE values.
    #[serde(
        rename = "TxDecimals",
        with = "decimals",
        skip_serializing_if = "Option::is_none"
    )]
    pub tx_decimals: Option<u32>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_vec(),
            checksum: ChecksumAlgo::Crc16Modbus,
            baud: DEFAULT_BAUD,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tx_start: DEFAULT_TX_START,
            rx_start: DEFAULT_RX_START,
            tx_decimals: None,
        }
    }
}

impl ProtocolConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Number of checksum bytes trailing each frame.
    pub fn checksum_len(&self) -> usize {
        self.checksum.len()
    }

    /// Host payload prefix, e.g. `!`.
    pub fn tx_prefix(&self) -> char {
        self.tx_start as char
    }

    /// Device payload prefix, e.g. `#`.
    pub fn rx_prefix(&self) -> char {
        self.rx_start as char
    }
}

/// Parse a hex byte string such as `"FC"` or `"AA 55"`. Empty is allowed.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, ConfigError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidPreamble(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ConfigError::InvalidPreamble(text.to_string()))
        })
        .collect()
}

mod preamble_hex {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::protocol::frame::hex_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_hex_bytes(&text).map_err(serde::de::Error::custom)
    }
}

/// Start characters are configured as strings; only the first byte counts.
mod start_char {
    use super::*;

    pub fn serialize<S: Serializer>(byte: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&(*byte as char).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.bytes()
            .next()
            .ok_or_else(|| serde::de::Error::custom("start character must not be empty"))
    }
}

/// `TxDecimals` may be an integer, a numeric string, or empty (unset).
mod decimals {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_u32(*v),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u32>, D::Error> {
        let raw = NumberOrString::deserialize(deserializer)?.into_string();
        Ok(raw.trim().parse::<u32>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.preamble, vec![0xFC]);
        assert_eq!(cfg.checksum, ChecksumAlgo::Crc16Modbus);
        assert_eq!(cfg.baud, 2_000_000);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.stop_bits, StopBits::One);
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.tx_start, b'!');
        assert_eq!(cfg.rx_start, b'#');
        assert_eq!(cfg.tx_decimals, None);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg = ProtocolConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ProtocolConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let cfg = ProtocolConfig::from_toml_str(
            r#"
            Preamble = "AA 55"
            Checksum = "sum8"
            Baud = 115200
            Parity = "E"
            StopBits = "2"
            Timeout = 500
            TxStart = "$"
            RxStart = "@x"
            TxDecimals = "3"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.preamble, vec![0xAA, 0x55]);
        assert_eq!(cfg.checksum, ChecksumAlgo::Sum8);
        assert_eq!(cfg.baud, 115_200);
        assert_eq!(cfg.parity, Parity::Even);
        assert_eq!(cfg.stop_bits, StopBits::Two);
        assert_eq!(cfg.timeout_ms, 500);
        assert_eq!(cfg.tx_start, b'$');
        assert_eq!(cfg.rx_start, b'@');
        assert_eq!(cfg.tx_decimals, Some(3));
    }

    #[test]
    fn test_empty_preamble_and_decimals() {
        let cfg = ProtocolConfig::from_toml_str(
            r#"
            Preamble = ""
            TxDecimals = ""
            StopBits = 1
            "#,
        )
        .unwrap();
        assert!(cfg.preamble.is_empty());
        assert_eq!(cfg.tx_decimals, None);
        assert_eq!(cfg.stop_bits, StopBits::One);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ProtocolConfig::from_toml_str(r#"Checksum = "CRC32""#).is_err());
        assert!(ProtocolConfig::from_toml_str(r#"Parity = "X""#).is_err());
        assert!(ProtocolConfig::from_toml_str(r#"StopBits = 3"#).is_err());
        assert!(ProtocolConfig::from_toml_str(r#"Preamble = "F""#).is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("fc").unwrap(), vec![0xFC]);
        assert_eq!(parse_hex_bytes("").unwrap(), Vec::<u8>::new());
        assert!(matches!(
            parse_hex_bytes("ZZ"),
            Err(ConfigError::InvalidPreamble(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("esclink-config-{}.toml", std::process::id()));
        let cfg = ProtocolConfig {
            tx_decimals: Some(1),
            parity: Parity::Odd,
            ..ProtocolConfig::default()
        };
        cfg.save_to_file(&path).unwrap();
        let loaded = ProtocolConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, cfg);
    }
}
