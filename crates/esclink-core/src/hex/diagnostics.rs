//! Offline image diagnostics.
//!
//! [`plan_flash`] predicts the per-block frame checksums and the ENDCRC
//! value a flash session will send. [`window_checksums`] dumps fixed-size
//! windows padded with `0xFF`, for comparison against a device-side dump.
//! The padding exists only here; [`HexImage::data_blocks`] never pads.

use super::image::HexImage;
use crate::config::ProtocolConfig;
use crate::protocol::checksum::{checksum_value, crc16_modbus};
use crate::protocol::command::{erase_sectors, program_request};
use crate::protocol::frame::{build_frame, frame_checksum};

/// Fill byte for addresses missing from the image.
pub const PAD_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBlock {
    pub index: usize,
    pub address: u32,
    pub len: usize,
    /// Checksum value of the PROGRAM frame carrying this block.
    pub frame_checksum: u16,
    /// Accumulator after this block is acknowledged.
    pub accumulated: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPlan {
    pub blocks: Vec<PlannedBlock>,
    pub total_bytes: usize,
    pub erase_sectors: usize,
    /// Value the VERIFY stage will send.
    pub end_checksum: u16,
}

/// Compute what a session with `block_size` will send for `image`.
pub fn plan_flash(image: &HexImage, block_size: usize, cfg: &ProtocolConfig) -> FlashPlan {
    let mut accumulated = 0u16;
    let mut total_bytes = 0;
    let blocks = image
        .data_blocks(block_size)
        .iter()
        .enumerate()
        .map(|(index, block)| {
            let frame = build_frame(&program_request(block, cfg), cfg);
            let frame_checksum = checksum_value(frame_checksum(&frame, cfg.checksum));
            accumulated = accumulated.wrapping_add(frame_checksum);
            total_bytes += block.len();
            PlannedBlock {
                index,
                address: block.address,
                len: block.len(),
                frame_checksum,
                accumulated,
            }
        })
        .collect();

    FlashPlan {
        blocks,
        total_bytes,
        erase_sectors: erase_sectors(total_bytes),
        end_checksum: accumulated,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowChecksum {
    pub index: usize,
    pub address: u32,
    /// Bytes of the window actually present in the image.
    pub present: usize,
    /// CRC16/MODBUS of the padded window.
    pub crc: u16,
    /// Wrapping sum of emitted window CRCs so far.
    pub running_sum: u16,
}

/// CRC of consecutive `window`-byte slices starting at the lowest address.
///
/// Windows holding no image bytes are skipped, so a sparse image costs
/// time proportional to its data rather than its address span.
pub fn window_checksums(image: &HexImage, window: usize) -> Vec<WindowChecksum> {
    let Some(base) = image.min_address() else {
        return Vec::new();
    };
    let window = window.max(1) as u64;

    let mut windows = Vec::new();
    let mut running_sum = 0u16;
    let mut cursor = base as u64;
    while cursor <= u32::MAX as u64 {
        let Some((next, _)) = image.range(cursor as u32..).next() else {
            break;
        };
        let index = (next - base) as u64 / window;
        let start = base as u64 + index * window;
        let end = (start + window).min(u32::MAX as u64 + 1);

        let mut bytes = vec![PAD_BYTE; window as usize];
        let mut present = 0;
        for (addr, byte) in image.range(start as u32..=(end - 1) as u32) {
            bytes[(addr as u64 - start) as usize] = byte;
            present += 1;
        }
        let crc = crc16_modbus(&bytes);
        running_sum = running_sum.wrapping_add(crc);
        windows.push(WindowChecksum {
            index: index as usize,
            address: start as u32,
            present,
            crc,
            running_sum,
        });
        cursor = start + window;
    }
    windows
}
