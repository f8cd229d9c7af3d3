//! Intel-HEX firmware images.
//!
//! - `record`: single-line decoding
//! - `image`: sparse image assembly and block chunking
//! - `diagnostics`: offline checksum planning and padded window dumps

pub mod diagnostics;
mod image;
mod record;

pub use diagnostics::{FlashPlan, PlannedBlock, WindowChecksum, plan_flash, window_checksums};
pub use image::{DataBlock, HexError, HexImage};
pub use record::{HexRecord, RecordError, RecordType, parse_line};
