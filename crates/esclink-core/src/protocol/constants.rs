//! Protocol constants.

/// Flash sector size the device erases in one step.
pub const ERASE_SECTOR_SIZE: usize = 2048;

/// Default PROGRAM block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// Every textual payload ends with this byte.
pub const PAYLOAD_TERMINATOR: u8 = b';';

/// Flash command keywords (follow the start character).
pub const CMD_HEX: &str = "HEX";
pub const CMD_ERASE_SIZE: &str = "HEX:ESIZE";
pub const CMD_START: &str = "HEX:START";
pub const CMD_END_CRC: &str = "HEX:ENDCRC";
pub const REPLY_ERASE: &str = "HEX:ERASE";
pub const REPLY_PREFIX: &str = "HEX:REPLY";

/// Parameter command keywords.
pub const CMD_READ: &str = "READ:";
pub const CMD_WRITE: &str = "WRITE";
pub const CMD_EXIT: &str = "EXIT";
/// Frame acknowledgment, sent by both sides.
pub const CMD_REPLY: &str = "REPLY:";

/// Default configuration values.
pub const DEFAULT_PREAMBLE: &[u8] = &[0xFC];
pub const DEFAULT_BAUD: u32 = 2_000_000;
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;
pub const DEFAULT_TX_START: u8 = b'!';
pub const DEFAULT_RX_START: u8 = b'#';

/// Default number of decimals used when formatting parameter values.
pub const DEFAULT_PRECISION: u32 = 2;

/// Longest payload the frame assembler will collect before giving up.
pub const MAX_FRAME_PAYLOAD: usize = 4096;
