//! Wire protocol: checksums, framing, flash commands and stream reassembly.

pub mod assembler;
pub mod checksum;
pub mod command;
pub mod constants;
pub mod frame;

pub use assembler::FrameAssembler;
pub use checksum::{ChecksumAlgo, checksum_bytes, checksum_value, crc16_modbus, sum8};
pub use frame::{FrameError, build_frame, frame_checksum, hex_upper, parse_frame};
