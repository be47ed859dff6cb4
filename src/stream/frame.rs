//! Framing of logged entries inside a block.
//!
//! A block is the unit handed from producers to the appender and from the appender to storage.
//! Storage treats it as opaque bytes; only writers and readers of the stream know its layout:
//!
//! ```text
//! | FrameHeader | bincode(LoggedEntry) | FrameHeader | bincode(LoggedEntry) | ...
//! ```

use anyhow::{Result, anyhow};
use tracing::warn;

use crate::error::{AppendError, LogReaderError};
use crate::types::{LoggedEntry, Position};

pub const FRAME_MAGIC_NUM: u32 = 0x_4C53_4652;
pub const FRAME_HEADER_SIZE: usize = 12; // 4 + 4 + 4

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the encoded entry following the header.
    pub size: u32,
    pub magic_num: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn new(size: u32, crc: u32) -> Self {
        Self {
            size,
            magic_num: FRAME_MAGIC_NUM,
            crc,
        }
    }

    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[8..12].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(anyhow!("Invalid frame header length {}", data.len()));
        }

        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let magic_num = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

        if magic_num != FRAME_MAGIC_NUM {
            return Err(anyhow!("Invalid frame magic number {:#x}", magic_num));
        }

        Ok(Self {
            size,
            magic_num,
            crc,
        })
    }
}

/// A framed, position-ordered batch of entries covering `[lowest, highest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    lowest_position: Position,
    highest_position: Position,
    data: Vec<u8>,
}

impl LogBlock {
    /// Wraps pre-framed bytes. Empty blocks and inverted ranges are programming errors.
    pub fn new(lowest: Position, highest: Position, data: Vec<u8>) -> Result<Self, AppendError> {
        if data.is_empty() {
            return Err(AppendError::InvalidBlock("block is empty".to_string()));
        }
        if lowest > highest {
            return Err(AppendError::InvalidBlock(format!(
                "lowest position {} is greater than highest position {}",
                lowest, highest
            )));
        }
        Ok(Self {
            lowest_position: lowest,
            highest_position: highest,
            data,
        })
    }

    pub fn lowest_position(&self) -> Position {
        self.lowest_position
    }

    pub fn highest_position(&self) -> Position {
        self.highest_position
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Position, Position, Vec<u8>) {
        (self.lowest_position, self.highest_position, self.data)
    }

    pub fn entries(&self) -> FrameIter<'_> {
        FrameIter::new(&self.data)
    }
}

/// Frames entries into a [`LogBlock`], enforcing strictly increasing positions.
#[derive(Debug, Default)]
pub struct LogBlockBuilder {
    lowest: Option<Position>,
    highest: Option<Position>,
    data: Vec<u8>,
}

impl LogBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: &LoggedEntry) -> Result<&mut Self, AppendError> {
        if let Some(highest) = self.highest {
            if entry.position <= highest {
                return Err(AppendError::InvalidBlock(format!(
                    "position {} does not follow {}",
                    entry.position, highest
                )));
            }
        }

        encode_frame(entry, &mut self.data)?;
        self.lowest.get_or_insert(entry.position);
        self.highest = Some(entry.position);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn build(self) -> Result<LogBlock, AppendError> {
        match (self.lowest, self.highest) {
            (Some(lowest), Some(highest)) => LogBlock::new(lowest, highest, self.data),
            _ => Err(AppendError::InvalidBlock("block is empty".to_string())),
        }
    }
}

/// Appends one framed entry to `out`.
pub fn encode_frame(entry: &LoggedEntry, out: &mut Vec<u8>) -> Result<(), AppendError> {
    let body = bincode::encode_to_vec(entry, bincode::config::standard()).map_err(|e| {
        warn!("Failed to encode logged entry {}: {}", entry.position, e);
        AppendError::InvalidBlock(format!("failed to encode entry {}: {}", entry.position, e))
    })?;

    let header = FrameHeader::new(body.len() as u32, crc32fast::hash(&body));
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(&body);
    Ok(())
}

/// Decodes the frame starting at `offset`, returning the entry and the offset of the next frame.
pub fn decode_frame(data: &[u8], offset: usize) -> Result<(LoggedEntry, usize), LogReaderError> {
    let header_end = offset + FRAME_HEADER_SIZE;
    if header_end > data.len() {
        return Err(LogReaderError::CorruptedEntry(format!(
            "truncated frame header at offset {}",
            offset
        )));
    }

    let header = FrameHeader::deserialize(&data[offset..header_end])
        .map_err(|e| LogReaderError::CorruptedEntry(format!("offset {}: {}", offset, e)))?;

    let body_end = header_end + header.size as usize;
    if body_end > data.len() {
        return Err(LogReaderError::CorruptedEntry(format!(
            "frame at offset {} claims {} bytes, block has {}",
            offset,
            header.size,
            data.len() - header_end
        )));
    }

    let body = &data[header_end..body_end];
    let actual_crc = crc32fast::hash(body);
    if actual_crc != header.crc {
        return Err(LogReaderError::CorruptedEntry(format!(
            "CRC mismatch at offset {}: expected {}, got {}",
            offset, header.crc, actual_crc
        )));
    }

    let (entry, _) = bincode::decode_from_slice::<LoggedEntry, _>(body, bincode::config::standard())
        .map_err(|e| LogReaderError::CorruptedEntry(format!("offset {}: {}", offset, e)))?;

    Ok((entry, body_end))
}

/// Iterates the entries framed in a block.
pub struct FrameIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<LoggedEntry, LogReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        match decode_frame(self.data, self.offset) {
            Ok((entry, next)) => {
                self.offset = next;
                Some(Ok(entry))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: Position) -> LoggedEntry {
        LoggedEntry::new(position, position * 10, format!("value_{}", position).into_bytes())
    }

    #[test]
    fn test_frame_header_rejects_bad_magic() {
        let mut bytes = FrameHeader::new(10, 1).serialize();
        bytes[4] ^= 0xff;
        assert!(FrameHeader::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_builder_frames_entries_in_order() {
        let followup = entry(11).with_source_position(10);
        let mut builder = LogBlockBuilder::new();
        builder.push(&entry(10)).unwrap();
        builder.push(&followup).unwrap();
        let block = builder.build().unwrap();

        assert_eq!(block.lowest_position(), 10);
        assert_eq!(block.highest_position(), 11);

        let entries: Vec<_> = block.entries().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries, vec![entry(10), followup]);
        assert_eq!(entries[1].source_position, Some(10));
    }

    #[test]
    fn test_builder_rejects_non_increasing_positions() {
        let mut builder = LogBlockBuilder::new();
        builder.push(&entry(5)).unwrap();
        assert!(matches!(
            builder.push(&entry(5)),
            Err(AppendError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_empty_block_is_rejected() {
        assert!(LogBlock::new(1, 1, Vec::new()).is_err());
        assert!(LogBlockBuilder::new().build().is_err());
        assert!(LogBlock::new(2, 1, vec![1]).is_err());
    }

    #[test]
    fn test_corrupted_frame_stops_iteration() {
        let mut builder = LogBlockBuilder::new();
        builder.push(&entry(1)).unwrap();
        builder.push(&entry(2)).unwrap();
        let (lowest, highest, mut data) = builder.build().unwrap().into_parts();
        let last = data.len() - 1;
        data[last] ^= 0x01;

        let block = LogBlock::new(lowest, highest, data).unwrap();
        let mut iter = block.entries();
        assert_eq!(iter.next().unwrap().unwrap().position, 1);
        assert!(matches!(
            iter.next(),
            Some(Err(LogReaderError::CorruptedEntry(_)))
        ));
        assert!(iter.next().is_none());
    }
}
