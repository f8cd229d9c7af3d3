//! Sparse firmware image built from Intel-HEX records.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::ops::RangeBounds;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use super::record::{RecordError, RecordType, parse_line};
use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum HexError {
    #[error("Line {line}: record does not start with ':'")]
    InvalidLineFormat { line: usize },

    #[error("Line {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: RecordError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HexError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::HexParseError
    }

    /// 1-based line number of the offending record.
    pub fn line(&self) -> Option<usize> {
        match self {
            HexError::InvalidLineFormat { line } | HexError::Record { line, .. } => Some(*line),
            HexError::Io(_) => None,
        }
    }
}

/// Contiguous run of image bytes sent in one PROGRAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

impl DataBlock {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First address after the block.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

/// Address-to-byte map of every data byte in a HEX file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    data: BTreeMap<u32, u8>,
    records: usize,
}

impl HexImage {
    /// Parse HEX text.
    pub fn parse_str(text: &str) -> Result<Self, HexError> {
        Self::from_lines(text.lines().map(|l| Ok(l.to_string())))
    }

    /// Parse from any buffered reader.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, HexError> {
        Self::from_lines(reader.lines())
    }

    /// Parse a HEX file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, HexError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading HEX image");
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn from_lines<I>(lines: I) -> Result<Self, HexError>
    where
        I: IntoIterator<Item = std::io::Result<String>>,
    {
        let mut image = HexImage::default();
        let mut extended = 0u32;

        for (index, line) in lines.into_iter().enumerate() {
            let line_no = index + 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(body) = line.strip_prefix(':') else {
                return Err(HexError::InvalidLineFormat { line: line_no });
            };
            let record = parse_line(body, extended).map_err(|source| HexError::Record {
                line: line_no,
                source,
            })?;
            image.records += 1;

            match record.record_type {
                RecordType::Data => {
                    for (i, byte) in record.data.iter().enumerate() {
                        image.data.insert(record.address.wrapping_add(i as u32), *byte);
                    }
                }
                RecordType::ExtendedLinearAddress => {
                    if record.data.len() == 2 {
                        extended = (u16::from_be_bytes([record.data[0], record.data[1]]) as u32) << 16;
                        debug!(base = %format!("{:08X}", extended), "Extended linear address");
                    }
                }
                RecordType::EndOfFile => break,
                other => debug!(line = line_no, record_type = %other, "Ignoring record"),
            }
        }

        info!(
            records = image.records,
            bytes = image.data.len(),
            "Parsed HEX image"
        );
        Ok(image)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of bytes present in the image.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Number of records decoded, EOF included.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn min_address(&self) -> Option<u32> {
        self.data.keys().next().copied()
    }

    pub fn max_address(&self) -> Option<u32> {
        self.data.keys().next_back().copied()
    }

    /// `max - min + 1`, or 0 for an empty image.
    pub fn total_span(&self) -> u64 {
        match (self.min_address(), self.max_address()) {
            (Some(min), Some(max)) => (max - min) as u64 + 1,
            _ => 0,
        }
    }

    /// Byte at `address`, if present.
    pub fn get(&self, address: u32) -> Option<u8> {
        self.data.get(&address).copied()
    }

    /// Present bytes in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.data.iter().map(|(&a, &b)| (a, b))
    }

    /// Present bytes within `range`, in ascending address order.
    pub fn range<R: RangeBounds<u32>>(&self, range: R) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.data.range(range).map(|(&a, &b)| (a, b))
    }

    /// Split into contiguous blocks of at most `block_size` bytes.
    ///
    /// A gap in the address space always ends a block. Gaps are never
    /// padded here.
    pub fn data_blocks(&self, block_size: usize) -> Vec<DataBlock> {
        let block_size = block_size.max(1);
        let mut blocks: Vec<DataBlock> = Vec::new();

        for (address, byte) in self.iter() {
            match blocks.last_mut() {
                Some(block) if block.end() == address as u64 && block.len() < block_size => {
                    block.data.push(byte);
                }
                _ => blocks.push(DataBlock {
                    address,
                    data: vec![byte],
                }),
            }
        }
        blocks
    }
}

impl FromIterator<(u32, u8)> for HexImage {
    fn from_iter<I: IntoIterator<Item = (u32, u8)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
            records: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Render a data record line for `address` with `data`.
    fn data_line(address: u16, data: &[u8]) -> String {
        record_line(address, 0x00, data)
    }

    fn record_line(address: u16, record_type: u8, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, record_type];
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(sum.wrapping_neg());
        let body: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}", body)
    }

    #[test]
    fn test_parse_simple_image() {
        let text = format!(
            "{}\n{}\n:00000001FF\n",
            data_line(0x0000, &[1, 2, 3, 4]),
            data_line(0x0004, &[5, 6])
        );
        let image = HexImage::parse_str(&text).unwrap();
        assert_eq!(image.data_len(), 6);
        assert_eq!(image.min_address(), Some(0));
        assert_eq!(image.max_address(), Some(5));
        assert_eq!(image.total_span(), 6);
        assert_eq!(image.record_count(), 3);
    }

    #[test]
    fn test_extended_linear_address() {
        let text = format!(
            "{}\n{}\n",
            record_line(0, 0x04, &[0x08, 0x00]),
            data_line(0x0010, &[0xAA])
        );
        let image = HexImage::parse_str(&text).unwrap();
        assert_eq!(image.get(0x0800_0010), Some(0xAA));
    }

    #[test]
    fn test_lines_after_eof_ignored() {
        let text = format!(":00000001FF\n{}\nnot hex at all\n", data_line(0, &[1]));
        let image = HexImage::parse_str(&text).unwrap();
        assert!(image.is_empty());
        assert!(image.data_blocks(2048).is_empty());
        assert_eq!(image.total_span(), 0);
    }

    #[test]
    fn test_blank_lines_skipped_and_errors_carry_line() {
        let text = format!("\n{}\n\nGARBAGE\n", data_line(0, &[1]));
        let err = HexImage::parse_str(&text).unwrap_err();
        assert!(matches!(err, HexError::InvalidLineFormat { line: 4 }));
        assert_eq!(err.kind(), ErrorKind::HexParseError);
    }

    #[test]
    fn test_bad_checksum_reports_line() {
        let text = format!("{}\n:0300300002337A1F\n", data_line(0, &[1]));
        let err = HexImage::parse_str(&text).unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert!(matches!(
            err,
            HexError::Record {
                source: RecordError::Checksum { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_segment_records_ignored() {
        let text = format!(
            "{}\n{}\n{}\n",
            record_line(0, 0x02, &[0x10, 0x00]),
            record_line(0, 0x05, &[0, 0, 0, 0]),
            data_line(0x0001, &[7])
        );
        let image = HexImage::parse_str(&text).unwrap();
        assert_eq!(image.get(1), Some(7));
    }

    #[test]
    fn test_contiguous_blocks() {
        let mut text = String::new();
        for i in 0..40u16 {
            text.push_str(&data_line(i * 16, &[i as u8; 16]));
            text.push('\n');
        }
        let image = HexImage::parse_str(&text).unwrap();
        let blocks = image.data_blocks(256);
        // 640 bytes / 256 = 3 blocks
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].len(), 256);
        assert_eq!(blocks[1].address, 256);
        assert_eq!(blocks[2].len(), 128);
    }

    #[test]
    fn test_gap_splits_block() {
        let text = format!(
            "{}\n{}\n",
            data_line(0x0000, &[1, 2]),
            data_line(0x0010, &[3, 4])
        );
        let image = HexImage::parse_str(&text).unwrap();
        let blocks = image.data_blocks(2048);
        assert_eq!(
            blocks,
            vec![
                DataBlock {
                    address: 0,
                    data: vec![1, 2]
                },
                DataBlock {
                    address: 0x10,
                    data: vec![3, 4]
                },
            ]
        );
    }

    #[test]
    fn test_collect_from_pairs() {
        let image: HexImage = (0..10u32).map(|a| (0x100 + a, a as u8)).collect();
        assert_eq!(image.data_blocks(4).len(), 3);
        assert_eq!(image.record_count(), 0);
    }

    #[test]
    fn test_from_reader() {
        let text = format!("{}\n", data_line(0x0100, &[9, 8]));
        let image = HexImage::from_reader(std::io::Cursor::new(text)).unwrap();
        assert_eq!(image.min_address(), Some(0x0100));
    }
}
