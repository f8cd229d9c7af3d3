//! Flash command payloads and reply parsing.
//!
//! Payloads here are unframed; the session wraps them with
//! [`build_frame`](super::frame::build_frame) before writing.

use super::constants::*;
use crate::config::ProtocolConfig;
use crate::hex::DataBlock;

/// `{tx}HEX;`
pub fn init_request(cfg: &ProtocolConfig) -> Vec<u8> {
    format!("{}{};", cfg.tx_prefix(), CMD_HEX).into_bytes()
}

/// `{rx}HEX;`
pub fn init_reply(cfg: &ProtocolConfig) -> Vec<u8> {
    format!("{}{};", cfg.rx_prefix(), CMD_HEX).into_bytes()
}

/// Number of erase sectors needed to hold `total_bytes`.
pub fn erase_sectors(total_bytes: usize) -> usize {
    total_bytes.div_ceil(ERASE_SECTOR_SIZE)
}

/// `{tx}HEX:ESIZE{sectors};`
pub fn erase_request(total_bytes: usize, cfg: &ProtocolConfig) -> Vec<u8> {
    format!(
        "{}{}{};",
        cfg.tx_prefix(),
        CMD_ERASE_SIZE,
        erase_sectors(total_bytes)
    )
    .into_bytes()
}

/// `{rx}HEX:ERASE;`
pub fn erase_reply(cfg: &ProtocolConfig) -> Vec<u8> {
    format!("{}{};", cfg.rx_prefix(), REPLY_ERASE).into_bytes()
}

/// `{tx}HEX:START{addr:08X},SIZE{len},DATA` + raw bytes + `;`
pub fn program_request(block: &DataBlock, cfg: &ProtocolConfig) -> Vec<u8> {
    let header = format!(
        "{}{}{:08X},SIZE{},DATA",
        cfg.tx_prefix(),
        CMD_START,
        block.address,
        block.len()
    );
    let mut payload = Vec::with_capacity(header.len() + block.len() + 1);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(&block.data);
    payload.push(PAYLOAD_TERMINATOR);
    payload
}

/// `{tx}HEX:ENDCRC` + accumulator (big-endian) + `;`
pub fn verify_request(accumulated: u16, cfg: &ProtocolConfig) -> Vec<u8> {
    let mut payload = format!("{}{}", cfg.tx_prefix(), CMD_END_CRC).into_bytes();
    payload.extend_from_slice(&accumulated.to_be_bytes());
    payload.push(PAYLOAD_TERMINATOR);
    payload
}

/// `{rx}HEX:REPLY`, the prefix of PROGRAM and VERIFY replies.
pub fn reply_prefix(cfg: &ProtocolConfig) -> Vec<u8> {
    format!("{}{}", cfg.rx_prefix(), REPLY_PREFIX).into_bytes()
}

/// Text the device is expected to send back after VERIFY.
pub fn verify_reply_text(accumulated: u16, cfg: &ProtocolConfig) -> String {
    format!("{}{}{:04X};", cfg.rx_prefix(), REPLY_PREFIX, accumulated)
}

/// Checksum bytes echoed in a PROGRAM reply.
///
/// The field is fixed-width: exactly `checksum_len` raw bytes after the
/// prefix, then the terminator. Returns `None` when the structure differs.
pub fn program_reply_echo<'a>(payload: &'a [u8], cfg: &ProtocolConfig) -> Option<&'a [u8]> {
    let rest = payload.strip_prefix(reply_prefix(cfg).as_slice())?;
    let (echo, tail) = rest.split_at_checked(cfg.checksum_len())?;
    (tail == [PAYLOAD_TERMINATOR]).then_some(echo)
}

/// Hex digits of a VERIFY reply, normalised to uppercase without spaces.
pub fn verify_reply_digits(payload: &[u8], cfg: &ProtocolConfig) -> Option<String> {
    let rest = payload.strip_prefix(reply_prefix(cfg).as_slice())?;
    let digits = rest.strip_suffix(&[PAYLOAD_TERMINATOR])?;
    let text = String::from_utf8_lossy(digits);
    Some(
        text.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase(),
    )
}

/// Whether a payload looks like a well-formed device reply (`{rx}HEX...;`).
pub fn is_device_reply(payload: &[u8], cfg: &ProtocolConfig) -> bool {
    let prefix = format!("{}{}", cfg.rx_prefix(), CMD_HEX);
    payload.starts_with(prefix.as_bytes()) && payload.last() == Some(&PAYLOAD_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_erase_payloads() {
        let cfg = ProtocolConfig::default();
        assert_eq!(init_request(&cfg), b"!HEX;");
        assert_eq!(init_reply(&cfg), b"#HEX;");
        assert_eq!(erase_request(4096, &cfg), b"!HEX:ESIZE2;");
        assert_eq!(erase_request(4097, &cfg), b"!HEX:ESIZE3;");
        assert_eq!(erase_reply(&cfg), b"#HEX:ERASE;");
        assert_eq!(erase_sectors(0), 0);
        assert_eq!(erase_sectors(1), 1);
    }

    #[test]
    fn test_program_payload() {
        let cfg = ProtocolConfig::default();
        let block = DataBlock {
            address: 0x0800_1000,
            data: vec![0x3B, 0x00, 0xFF],
        };
        let payload = program_request(&block, &cfg);
        let mut expected = b"!HEX:START08001000,SIZE3,DATA".to_vec();
        expected.extend_from_slice(&[0x3B, 0x00, 0xFF, b';']);
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_verify_payload_big_endian() {
        let cfg = ProtocolConfig::default();
        assert_eq!(verify_request(0x1234, &cfg), b"!HEX:ENDCRC\x12\x34;");
        assert_eq!(verify_reply_text(0x00AB, &cfg), "#HEX:REPLY00AB;");
    }

    #[test]
    fn test_program_reply_echo() {
        let cfg = ProtocolConfig::default();
        assert_eq!(
            program_reply_echo(b"#HEX:REPLY\x3B\x01;", &cfg),
            Some(&[0x3B, 0x01][..])
        );
        assert_eq!(program_reply_echo(b"#HEX:REPLY\x01;", &cfg), None);
        assert_eq!(program_reply_echo(b"#HEX:REPLY\x01\x02\x03;", &cfg), None);
        assert_eq!(program_reply_echo(b"#HEX:ERASE;", &cfg), None);
    }

    #[test]
    fn test_verify_reply_digits() {
        let cfg = ProtocolConfig::default();
        assert_eq!(
            verify_reply_digits(b"#HEX:REPLY ab 12;", &cfg).as_deref(),
            Some("AB12")
        );
        assert_eq!(verify_reply_digits(b"#HEX:REPLYAB12", &cfg), None);
    }

    #[test]
    fn test_is_device_reply() {
        let cfg = ProtocolConfig::default();
        assert!(is_device_reply(b"#HEX:ERASE;", &cfg));
        assert!(!is_device_reply(b"#READ;", &cfg));
        assert!(!is_device_reply(b"#HEX", &cfg));
    }
}
