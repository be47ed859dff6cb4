use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::error::LogStorageError;
use crate::traits::StorageResult;
use crate::types::Position;

use super::entry::{BLOCK_HEADER_SIZE, BlockHeader, BlockMeta};

/// Segment file prefix
pub(crate) const SEGMENT_FILE_PREFIX: &str = "segment_";

/// Segment file extension
pub(crate) const SEGMENT_FILE_EXT: &str = ".log";

pub(crate) fn segment_file_name(segment_id: u64) -> String {
    format!("{}{:010}{}", SEGMENT_FILE_PREFIX, segment_id, SEGMENT_FILE_EXT)
}

/// Parses the id out of a segment file name, `None` for unrelated files.
pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    if !name.starts_with(SEGMENT_FILE_PREFIX) || !name.ends_with(SEGMENT_FILE_EXT) {
        return None;
    }
    name.trim_start_matches(SEGMENT_FILE_PREFIX)
        .trim_end_matches(SEGMENT_FILE_EXT)
        .parse::<u64>()
        .ok()
}

pub struct LogSegment {
    pub(crate) segment_id: u64,
    pub(crate) file_path: PathBuf,
    pub(crate) file: Arc<File>,
    /// Index of the blocks in this segment, ordered by position.
    pub(crate) blocks: Vec<BlockMeta>,
    pub(crate) file_size: u64,
    /// Whether this segment is sealed (read-only)
    pub(crate) sealed: bool,
}

impl LogSegment {
    /// Creates a new, empty segment file.
    pub fn create(dir: &Path, segment_id: u64) -> StorageResult<Self> {
        let file_path = dir.join(segment_file_name(segment_id));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;

        info!("Created new segment: id={}, path={:?}", segment_id, file_path);

        Ok(Self {
            segment_id,
            file_path,
            file: Arc::new(file),
            blocks: Vec::new(),
            file_size: 0,
            sealed: false,
        })
    }

    /// Opens an existing segment and rebuilds its block index.
    ///
    /// A torn tail is only tolerated in the active (last) segment, where it is cut off so that
    /// appends continue after the last intact block. Sealed segments must be intact.
    pub fn open(file_path: PathBuf, segment_id: u64, active: bool) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&file_path)?;
        let file_size = file.metadata()?.len();

        let mut segment = Self {
            segment_id,
            file_path,
            file: Arc::new(file),
            blocks: Vec::new(),
            file_size,
            sealed: !active,
        };

        segment.replay_segment(active)?;

        info!(
            "Loaded segment: id={}, size={}, blocks={}",
            segment_id,
            segment.file_size,
            segment.blocks.len()
        );

        Ok(segment)
    }

    /// Replay the segment file to rebuild the block index from scratch.
    fn replay_segment(&mut self, truncate_torn_tail: bool) -> StorageResult<()> {
        self.blocks.clear();

        let file_size = self.file_size;
        let mut offset: u64 = 0;
        let mut header_buf = [0u8; BLOCK_HEADER_SIZE as usize];

        while offset < file_size {
            let invalid = match self.read_block_at(offset, file_size, &mut header_buf) {
                Ok(meta) => {
                    if let Some(last) = self.blocks.last() {
                        if meta.lowest_position <= last.highest_position {
                            return Err(LogStorageError::CorruptedBlock {
                                segment_id: self.segment_id,
                                offset,
                                reason: format!(
                                    "block [{}, {}] does not follow position {}",
                                    meta.lowest_position,
                                    meta.highest_position,
                                    last.highest_position
                                ),
                            });
                        }
                    }
                    offset = meta.offset + meta.size;
                    self.blocks.push(meta);
                    None
                }
                Err(reason) => Some(reason),
            };

            if let Some(reason) = invalid {
                if !truncate_torn_tail {
                    return Err(LogStorageError::CorruptedBlock {
                        segment_id: self.segment_id,
                        offset,
                        reason,
                    });
                }

                warn!(
                    "Truncating torn tail of segment {} at offset {}: {}",
                    self.segment_id, offset, reason
                );
                self.file.set_len(offset)?;
                self.file.sync_data()?;
                self.file_size = offset;
                break;
            }
        }

        Ok(())
    }

    /// Reads and validates the block at `offset` during replay.
    fn read_block_at(
        &self,
        offset: u64,
        file_size: u64,
        header_buf: &mut [u8],
    ) -> Result<BlockMeta, String> {
        if offset + BLOCK_HEADER_SIZE as u64 > file_size {
            return Err("incomplete header".to_string());
        }
        self.file
            .read_exact_at(header_buf, offset)
            .map_err(|e| e.to_string())?;

        let header = BlockHeader::deserialize(header_buf).map_err(|e| e.to_string())?;
        let data_offset = offset + BLOCK_HEADER_SIZE as u64;
        if data_offset + header.size as u64 > file_size {
            return Err("incomplete block data".to_string());
        }

        let mut data = vec![0u8; header.size as usize];
        self.file
            .read_exact_at(&mut data, data_offset)
            .map_err(|e| e.to_string())?;

        let actual_crc = crc32fast::hash(&data);
        if actual_crc != header.crc {
            return Err(format!(
                "CRC mismatch: expected {}, got {}",
                header.crc, actual_crc
            ));
        }

        Ok(BlockMeta {
            lowest_position: header.lowest_position,
            highest_position: header.highest_position,
            offset: data_offset,
            size: header.size as u64,
            crc: header.crc,
        })
    }

    pub fn write_block(
        &mut self,
        lowest: Position,
        highest: Position,
        data: &[u8],
    ) -> StorageResult<BlockMeta> {
        let crc = crc32fast::hash(data);
        let header = BlockHeader::new(data.len() as u32, crc, lowest, highest);

        let mut buf = header.serialize();
        buf.extend_from_slice(data);

        self.file.write_all_at(&buf, self.file_size).map_err(|e| {
            warn!("Failed to write block to segment {}: {}", self.segment_id, e);
            e
        })?;

        let meta = BlockMeta {
            lowest_position: lowest,
            highest_position: highest,
            offset: self.file_size + BLOCK_HEADER_SIZE as u64,
            size: data.len() as u64,
            crc,
        };
        self.file_size += buf.len() as u64;
        self.blocks.push(meta);

        Ok(meta)
    }

    pub fn sync_data(&self) -> StorageResult<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    /// Copies the block described by `meta` into the front of `buf`, verifying its checksum.
    pub fn read_block(&self, meta: &BlockMeta, buf: &mut [u8]) -> StorageResult<()> {
        let size = meta.size as usize;
        let target = &mut buf[..size];
        self.file.read_exact_at(target, meta.offset)?;

        let actual_crc = crc32fast::hash(target);
        if actual_crc != meta.crc {
            return Err(LogStorageError::CorruptedBlock {
                segment_id: self.segment_id,
                offset: meta.offset,
                reason: format!("CRC mismatch: expected {}, got {}", meta.crc, actual_crc),
            });
        }
        Ok(())
    }

    /// Index of the last block whose lowest position is `<= position`.
    pub fn find_block(&self, position: Position) -> Option<usize> {
        let idx = self
            .blocks
            .partition_point(|meta| meta.lowest_position <= position);
        idx.checked_sub(1)
    }

    pub fn first_position(&self) -> Option<Position> {
        self.blocks.first().map(|meta| meta.lowest_position)
    }

    pub fn last_position(&self) -> Option<Position> {
        self.blocks.last().map(|meta| meta.highest_position)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
