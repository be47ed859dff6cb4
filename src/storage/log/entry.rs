use anyhow::{Result, anyhow};

use crate::types::Position;

/// Location of one block inside a segment file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockMeta {
    pub lowest_position: Position,
    pub highest_position: Position,
    /// File offset of the block data (after the header).
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
}

impl BlockMeta {
    pub fn contains(&self, position: Position) -> bool {
        position >= self.lowest_position && position <= self.highest_position
    }
}

pub const BLOCK_MAGIC_NUM: u32 = 0x_1234_5678;
pub const BLOCK_HEADER_SIZE: u32 = 28; // 4 + 4 + 4 + 8 + 8 = 28 bytes

// Segment file format:
// | BlockHeader | block data | BlockHeader | block data | ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub size: u32,
    pub magic_num: u32,
    pub crc: u32,
    pub lowest_position: Position,
    pub highest_position: Position,
}

impl BlockHeader {
    pub fn new(size: u32, crc: u32, lowest_position: Position, highest_position: Position) -> Self {
        Self {
            size,
            magic_num: BLOCK_MAGIC_NUM,
            crc,
            lowest_position,
            highest_position,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE as usize);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.magic_num.to_le_bytes());
        buf.extend_from_slice(&self.crc.to_le_bytes());
        buf.extend_from_slice(&self.lowest_position.to_le_bytes());
        buf.extend_from_slice(&self.highest_position.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid length"));
        }

        let mut u32_bytes = [0u8; 4];
        u32_bytes.copy_from_slice(&data[0..4]);
        let size = u32::from_le_bytes(u32_bytes);

        u32_bytes.copy_from_slice(&data[4..8]);
        let magic_num = u32::from_le_bytes(u32_bytes);

        u32_bytes.copy_from_slice(&data[8..12]);
        let crc = u32::from_le_bytes(u32_bytes);

        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&data[12..20]);
        let lowest_position = u64::from_le_bytes(u64_bytes);

        u64_bytes.copy_from_slice(&data[20..28]);
        let highest_position = u64::from_le_bytes(u64_bytes);

        if magic_num != BLOCK_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number"));
        }
        if lowest_position > highest_position {
            return Err(anyhow!(
                "Invalid position range [{}, {}]",
                lowest_position,
                highest_position
            ));
        }

        Ok(Self {
            size,
            magic_num,
            crc,
            lowest_position,
            highest_position,
        })
    }
}
