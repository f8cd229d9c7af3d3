//! READ/WRITE payload encoding and READ response decoding.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, trace};

use super::mapping::{GroupMapping, compare_keys};
use crate::config::{ProtocolConfig, parse_hex_bytes};
use crate::error::ErrorKind;
use crate::protocol::constants::{
    CMD_READ, CMD_REPLY, CMD_WRITE, DEFAULT_PRECISION, PAYLOAD_TERMINATOR,
};
use crate::protocol::frame::{FrameError, build_frame};
use crate::transport::TransportError;

fn bound(value: &Option<f64>, unbounded: &str) -> String {
    value.map_or_else(|| unbounded.to_string(), |v| v.to_string())
}

#[derive(Error, Debug)]
pub enum ParamError {
    #[error(
        "{group}.{key} = {value} is outside [{}, {}]",
        bound(.min, "-inf"),
        bound(.max, "inf")
    )]
    BoundsViolation {
        group: String,
        key: String,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("{key}: {value} is not a finite number")]
    InvalidValue { key: String, value: f64 },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No response within {timeout_ms}ms")]
    NoResponse { timeout_ms: u32 },

    #[error("Acknowledgment names checksum {actual}, expected {expected}")]
    AckMismatch { expected: String, actual: String },
}

impl ParamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParamError::BoundsViolation { .. } => ErrorKind::BoundsViolation,
            ParamError::InvalidValue { .. } => ErrorKind::InvalidValue,
            ParamError::Frame(e) => e.kind(),
            ParamError::Transport(_) => ErrorKind::Transport,
            ParamError::NoResponse { .. } => ErrorKind::NoResponse,
            ParamError::AckMismatch { .. } => ErrorKind::DataMismatch,
        }
    }
}

/// Decoded READ reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResponse {
    pub values: BTreeMap<String, f64>,
    /// Non-empty segments that could not be decoded.
    pub skipped: usize,
}

impl ReadResponse {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in numeric key order.
    pub fn sorted(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> =
            self.values.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        entries.sort_by(|a, b| compare_keys(a.0, b.0));
        entries
    }
}

/// Decimals used for `key`: global override, then mapping, then default.
fn precision_for(key: &str, mapping: &GroupMapping, cfg: &ProtocolConfig) -> usize {
    cfg.tx_decimals
        .or_else(|| mapping.get(key).map(|p| p.precision))
        .unwrap_or(DEFAULT_PRECISION) as usize
}

/// `{tx}WRITE{k}:{v},...;` with keys in numeric order.
pub fn write_payload(
    values: &BTreeMap<String, f64>,
    mapping: &GroupMapping,
    cfg: &ProtocolConfig,
) -> Vec<u8> {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort_by(|a, b| compare_keys(a, b));

    let body = keys
        .iter()
        .map(|key| {
            let precision = precision_for(key, mapping, cfg);
            format!("{}:{:.*}", key, precision, values[*key])
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{}{};", cfg.tx_prefix(), CMD_WRITE, body).into_bytes()
}

/// Framed WRITE request for `group`.
pub fn build_write_frame(
    group: &str,
    values: &BTreeMap<String, f64>,
    mapping: &GroupMapping,
    cfg: &ProtocolConfig,
) -> Vec<u8> {
    let payload = write_payload(values, mapping, cfg);
    debug!(group, payload = %String::from_utf8_lossy(&payload), "Built WRITE");
    build_frame(&payload, cfg)
}

/// Framed `{tx}READ:{group};` request.
pub fn build_read_request(group: &str, cfg: &ProtocolConfig) -> Vec<u8> {
    let payload = format!("{}{}{};", cfg.tx_prefix(), CMD_READ, group);
    build_frame(payload.as_bytes(), cfg)
}

/// Decode `{rx}k:v,k:v;`. Malformed segments are skipped and counted.
pub fn parse_read_response(payload: &[u8], cfg: &ProtocolConfig) -> ReadResponse {
    let mut response = ReadResponse::default();
    if payload.first() != Some(&cfg.rx_start) || payload.last() != Some(&PAYLOAD_TERMINATOR) {
        debug!("READ response is not a device payload");
        return response;
    }
    if payload.len() < 2 {
        return response;
    }
    let inner = String::from_utf8_lossy(&payload[1..payload.len() - 1]);

    for segment in inner.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let parsed = segment.split_once(':').and_then(|(key, value)| {
            let value = value.trim().parse::<f64>().ok()?;
            Some((key.trim().to_string(), value))
        });
        match parsed {
            Some((key, value)) if !key.is_empty() => {
                response.values.insert(key, value);
            }
            _ => {
                trace!(segment, "Skipping malformed segment");
                response.skipped += 1;
            }
        }
    }
    response
}

/// `{tx}REPLY:` + checksum bytes + `;`, acknowledging a received frame.
pub fn ack_payload(checksum: &[u8], cfg: &ProtocolConfig) -> Vec<u8> {
    let mut payload = format!("{}{}", cfg.tx_prefix(), CMD_REPLY).into_bytes();
    payload.extend_from_slice(checksum);
    payload.push(PAYLOAD_TERMINATOR);
    payload
}

/// Data carried by a device `{rx}REPLY:<data>;` payload.
pub fn parse_ack<'a>(payload: &'a [u8], cfg: &ProtocolConfig) -> Option<&'a [u8]> {
    let prefix = format!("{}{}", cfg.rx_prefix(), CMD_REPLY);
    payload
        .strip_prefix(prefix.as_bytes())?
        .strip_suffix(&[PAYLOAD_TERMINATOR])
}

/// Whether acknowledgment data names `expected`. The device sends the
/// checksum either as raw bytes or as hex text such as `6B A0`.
pub fn ack_matches(data: &[u8], expected: &[u8]) -> bool {
    if data == expected {
        return true;
    }
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| parse_hex_bytes(text).ok())
        .is_some_and(|decoded| decoded == expected)
}

/// Check every value against the mapping before anything is sent.
pub fn validate_write(
    group: &str,
    values: &BTreeMap<String, f64>,
    mapping: &GroupMapping,
) -> Result<(), ParamError> {
    for (key, &value) in values {
        if !value.is_finite() {
            return Err(ParamError::InvalidValue {
                key: key.clone(),
                value,
            });
        }
        if let Some(param) = mapping.get(key) {
            if !param.contains(value) {
                return Err(ParamError::BoundsViolation {
                    group: group.to_string(),
                    key: key.clone(),
                    value,
                    min: param.min,
                    max: param.max,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::mapping::ParamDescriptor;
    use crate::protocol::frame::parse_frame;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_write_payload_numeric_order() {
        let cfg = ProtocolConfig::default();
        let payload = write_payload(
            &values(&[("A10", 1.0), ("A2", 2.0), ("A1", 3.0)]),
            &GroupMapping::empty("A"),
            &cfg,
        );
        assert_eq!(payload, b"!WRITEA1:3.00,A2:2.00,A10:1.00;");
    }

    #[test]
    fn test_precision_resolution() {
        let mapping = GroupMapping::new(
            "A",
            vec![
                ParamDescriptor::new("A0").with_precision(0),
                ParamDescriptor::new("A1").with_precision(3),
            ],
        );
        let vals = values(&[("A0", 14.6), ("A1", 0.5), ("A2", 1.0)]);
        let cfg = ProtocolConfig::default();
        assert_eq!(
            write_payload(&vals, &mapping, &cfg),
            b"!WRITEA0:15,A1:0.500,A2:1.00;"
        );

        let cfg = ProtocolConfig {
            tx_decimals: Some(1),
            ..ProtocolConfig::default()
        };
        assert_eq!(
            write_payload(&vals, &mapping, &cfg),
            b"!WRITEA0:14.6,A1:0.5,A2:1.0;"
        );
    }

    #[test]
    fn test_no_scientific_notation() {
        let cfg = ProtocolConfig::default();
        let payload = write_payload(&values(&[("A0", 1e7)]), &GroupMapping::empty("A"), &cfg);
        assert_eq!(payload, b"!WRITEA0:10000000.00;");
    }

    #[test]
    fn test_write_frame_is_framed() {
        let cfg = ProtocolConfig::default();
        let frame = build_write_frame("A", &values(&[("A0", 1.0)]), &GroupMapping::empty("A"), &cfg);
        assert_eq!(parse_frame(&frame, &cfg).unwrap(), b"!WRITEA0:1.00;");
    }

    #[test]
    fn test_read_request() {
        let cfg = ProtocolConfig::default();
        let frame = build_read_request("B", &cfg);
        assert_eq!(parse_frame(&frame, &cfg).unwrap(), b"!READ:B;");
    }

    #[test]
    fn test_parse_read_response() {
        let cfg = ProtocolConfig::default();
        let resp = parse_read_response(b"#A0:14.00,A1:60,bogus,A2:x,,A3:-1.5;", &cfg);
        assert_eq!(resp.values.len(), 3);
        assert_eq!(resp.values["A1"], 60.0);
        assert_eq!(resp.values["A3"], -1.5);
        assert_eq!(resp.skipped, 2);
        let keys: Vec<&str> = resp.sorted().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["A0", "A1", "A3"]);
    }

    #[test]
    fn test_parse_rejects_wrong_envelope() {
        let cfg = ProtocolConfig::default();
        assert!(parse_read_response(b"!A0:1;", &cfg).is_empty());
        assert!(parse_read_response(b"#A0:1", &cfg).is_empty());
        assert!(parse_read_response(b"", &cfg).is_empty());
        assert!(parse_read_response(b"#", &cfg).is_empty());
    }

    #[test]
    fn test_validate_inclusive_bounds() {
        let mapping = GroupMapping::new(
            "A",
            vec![ParamDescriptor::new("A0").with_bounds(Some(10.0), Some(20.0))],
        );
        assert!(validate_write("A", &values(&[("A0", 10.0)]), &mapping).is_ok());
        assert!(validate_write("A", &values(&[("A0", 20.0)]), &mapping).is_ok());
        assert!(validate_write("A", &values(&[("A9", 1e9)]), &mapping).is_ok());

        let err = validate_write("A", &values(&[("A0", 10.0 - 1e-9)]), &mapping).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BoundsViolation);
        assert!(err.to_string().starts_with("A.A0 = "));
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let mapping = GroupMapping::empty("A");
        let err = validate_write("A", &values(&[("A0", f64::NAN)]), &mapping).unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { .. }));
        assert!(validate_write("A", &values(&[("A0", f64::INFINITY)]), &mapping).is_err());
    }

    #[test]
    fn test_ack_payload_carries_raw_checksum() {
        let cfg = ProtocolConfig::default();
        assert_eq!(ack_payload(&[0x6B, 0xA0], &cfg), b"!REPLY:\x6B\xA0;");
    }

    #[test]
    fn test_parse_ack() {
        let cfg = ProtocolConfig::default();
        assert_eq!(parse_ack(b"#REPLY:6B A0;", &cfg), Some(&b"6B A0"[..]));
        assert_eq!(parse_ack(b"#REPLY:;", &cfg), Some(&b""[..]));
        assert_eq!(parse_ack(b"#A0:1;", &cfg), None);
        assert_eq!(parse_ack(b"#REPLY:6BA0", &cfg), None);
    }

    #[test]
    fn test_ack_matches_raw_and_text() {
        let expected = [0x6B, 0xA0];
        assert!(ack_matches(&expected, &expected));
        assert!(ack_matches(b"6B A0", &expected));
        assert!(ack_matches(b"6ba0", &expected));
        assert!(!ack_matches(b"6B A1", &expected));
        assert!(!ack_matches(b"6B A", &expected));
        assert!(!ack_matches(&[0xA0, 0x6B], &expected));
    }
}
