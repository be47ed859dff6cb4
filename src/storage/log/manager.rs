//! Segment Manager for log storage.
//!
//! This module provides multi-segment management with:
//! - Automatic segment rotation when max size is reached
//! - Block lookup by position across segments
//! - Deletion of sealed segments below a compaction bound
//! - Disk footprint and position range statistics

use std::{fmt, fs, path::PathBuf};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::LogStorageError;
use crate::traits::{BlockRead, StorageResult};
use crate::types::Position;

use super::entry::BlockMeta;
use super::segment::{LogSegment, parse_segment_id};

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration options for the segmented log storage
#[derive(Clone, Debug)]
pub struct SegmentedLogStorageOptions {
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Whether to fsync before acknowledging a commit
    pub sync_on_write: bool,
    /// Max number of append requests written per commit
    pub batch_size: usize,
}

impl Default for SegmentedLogStorageOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/logs"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_on_write: true,
            batch_size: 100,
        }
    }
}

impl SegmentedLogStorageOptions {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// Position of a storage reader: a block inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockCursor {
    pub segment_id: u64,
    pub block_index: usize,
}

struct Segments {
    /// Ordered by segment id; the last one is the active (writable) segment.
    segments: Vec<LogSegment>,
    next_segment_id: u64,
    last_position: Option<Position>,
    commit_position: Option<Position>,
}

/// Manages the segments of one partition log.
pub struct SegmentManager {
    options: SegmentedLogStorageOptions,
    state: RwLock<Segments>,
}

impl SegmentManager {
    /// Opens the segments found in `options.dir`, or creates the first one.
    pub fn new(options: SegmentedLogStorageOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)?;

        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&options.dir)? {
            let path = entry?.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_id)
            {
                segment_files.push((id, path));
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(segment_files.len().max(1));
        let count = segment_files.len();
        for (i, (id, path)) in segment_files.into_iter().enumerate() {
            let active = i + 1 == count;
            segments.push(LogSegment::open(path, id, active)?);
        }

        let next_segment_id = match segments.last() {
            Some(last) => last.segment_id + 1,
            None => {
                segments.push(LogSegment::create(&options.dir, 0)?);
                1
            }
        };

        let mut last_position = None;
        for segment in &segments {
            if let (Some(first), Some(last)) = (segment.first_position(), last_position) {
                if first <= last {
                    return Err(LogStorageError::CorruptedBlock {
                        segment_id: segment.segment_id,
                        offset: 0,
                        reason: format!(
                            "segment starts at {} which does not follow {}",
                            first, last
                        ),
                    });
                }
            }
            last_position = segment.last_position().or(last_position);
        }

        info!(
            "Opened log storage: dir={:?}, segments={}, last_position={:?}",
            options.dir,
            segments.len(),
            last_position
        );

        Ok(Self {
            options,
            state: RwLock::new(Segments {
                segments,
                next_segment_id,
                last_position,
                // everything that survived replay is durable
                commit_position: last_position,
            }),
        })
    }

    pub fn options(&self) -> &SegmentedLogStorageOptions {
        &self.options
    }

    /// Writes a block to the active segment, rotating first if it is full.
    pub fn write_block(
        &self,
        lowest: Position,
        highest: Position,
        data: &[u8],
    ) -> StorageResult<BlockMeta> {
        let mut state = self.state.write();

        if let Some(last) = state.last_position {
            if lowest <= last {
                return Err(LogStorageError::OutOfOrder {
                    lowest,
                    highest,
                    last,
                });
            }
        }

        let needs_rotation = state
            .segments
            .last()
            .is_some_and(|s| !s.is_empty() && s.file_size >= self.options.max_segment_size);
        if needs_rotation {
            Self::rotate_segment(&mut state, &self.options)?;
        }

        let active = state
            .segments
            .last_mut()
            .ok_or(LogStorageError::SegmentNotFound(0))?;
        let meta = active.write_block(lowest, highest, data)?;
        state.last_position = Some(highest);

        Ok(meta)
    }

    fn rotate_segment(state: &mut Segments, options: &SegmentedLogStorageOptions) -> StorageResult<()> {
        let next_id = state.next_segment_id;
        let new_segment = LogSegment::create(&options.dir, next_id)?;

        if let Some(active) = state.segments.last_mut() {
            active.sync_data()?;
            active.sealed = true;
        }
        state.segments.push(new_segment);
        state.next_segment_id += 1;

        info!("Rotated to new segment: id={}", next_id);
        Ok(())
    }

    /// Flushes the active segment and marks everything up to `position` as committed.
    pub fn commit(&self, position: Position) -> StorageResult<()> {
        if self.options.sync_on_write {
            let state = self.state.read();
            if let Some(active) = state.segments.last() {
                active.sync_data()?;
            }
        }

        let mut state = self.state.write();
        if state.commit_position.is_none_or(|current| current < position) {
            state.commit_position = Some(position);
        }
        Ok(())
    }

    pub fn commit_position(&self) -> Option<Position> {
        self.state.read().commit_position
    }

    pub fn last_position(&self) -> Option<Position> {
        self.state.read().last_position
    }

    pub fn first_position(&self) -> Option<Position> {
        let state = self.state.read();
        state.segments.iter().find_map(|s| s.first_position())
    }

    /// Cursor on the block that contains `position`, or the closest block before it.
    pub(crate) fn seek(&self, position: Position) -> BlockCursor {
        let state = self.state.read();

        for segment in state.segments.iter().rev() {
            if let Some(block_index) = segment.find_block(position) {
                return BlockCursor {
                    segment_id: segment.segment_id,
                    block_index,
                };
            }
        }

        // below every block: start at the very beginning
        BlockCursor {
            segment_id: state.segments.first().map_or(0, |s| s.segment_id),
            block_index: 0,
        }
    }

    pub(crate) fn first_cursor(&self) -> BlockCursor {
        let state = self.state.read();
        BlockCursor {
            segment_id: state.segments.first().map_or(0, |s| s.segment_id),
            block_index: 0,
        }
    }

    /// Reads the committed block at `cursor`, advancing the cursor past it.
    pub(crate) fn read_block(&self, cursor: &mut BlockCursor, buf: &mut [u8]) -> StorageResult<BlockRead> {
        let state = self.state.read();

        let mut idx = state
            .segments
            .binary_search_by_key(&cursor.segment_id, |s| s.segment_id)
            .map_err(|_| LogStorageError::SegmentNotFound(cursor.segment_id))?;

        loop {
            let segment = &state.segments[idx];
            if let Some(meta) = segment.blocks.get(cursor.block_index) {
                if state
                    .commit_position
                    .is_none_or(|committed| meta.highest_position > committed)
                {
                    return Ok(BlockRead::NoData);
                }

                let required = meta.size as usize;
                if required > buf.len() {
                    return Ok(BlockRead::InsufficientCapacity { required });
                }

                segment.read_block(meta, buf)?;
                cursor.block_index += 1;
                return Ok(BlockRead::Block { len: required });
            }

            // end of this segment, continue with the next one if it exists
            if idx + 1 >= state.segments.len() {
                return Ok(BlockRead::NoData);
            }
            idx += 1;
            cursor.segment_id = state.segments[idx].segment_id;
            cursor.block_index = 0;
        }
    }

    /// Deletes sealed segments whose entries all lie below `bound`.
    pub fn delete_until(&self, bound: Position) -> StorageResult<usize> {
        let mut state = self.state.write();
        let active_id = state.segments.last().map(|s| s.segment_id);

        let mut removed = 0;
        while let Some(first) = state.segments.first() {
            if Some(first.segment_id) == active_id {
                break;
            }
            if first.last_position().is_some_and(|last| last >= bound) {
                break;
            }

            let segment = state.segments.remove(0);
            if let Err(e) = fs::remove_file(&segment.file_path) {
                warn!(
                    "Failed to delete compacted segment {:?}: {}",
                    segment.file_path, e
                );
                state.segments.insert(0, segment);
                return Err(e.into());
            }

            info!(
                "Deleted compacted segment: id={}, freed={}B, bound={}",
                segment.segment_id, segment.file_size, bound
            );
            removed += 1;
        }

        Ok(removed)
    }

    /// Get segment count (active + sealed)
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Segment footprint and position range of the log.
    pub fn disk_stats(&self) -> DiskStats {
        let state = self.state.read();

        DiskStats {
            segment_count: state.segments.len(),
            sealed_segment_count: state.segments.iter().filter(|s| s.sealed).count(),
            total_bytes: state.segments.iter().map(|s| s.file_size).sum(),
            active_segment_bytes: state.segments.last().map_or(0, |s| s.file_size),
            first_position: state.segments.iter().find_map(|s| s.first_position()),
            commit_position: state.commit_position,
        }
    }
}

/// What the log occupies on disk and which positions it still holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStats {
    pub segment_count: usize,
    pub sealed_segment_count: usize,
    pub total_bytes: u64,
    pub active_segment_bytes: u64,
    /// Lowest position still on disk; compaction moves it forward.
    pub first_position: Option<Position>,
    pub commit_position: Option<Position>,
}

impl fmt::Display for DiskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segments={} (sealed={}), bytes={} (active={}), positions={}..{}",
            self.segment_count,
            self.sealed_segment_count,
            self.total_bytes,
            self.active_segment_bytes,
            fmt_position(self.first_position),
            fmt_position(self.commit_position),
        )
    }
}

fn fmt_position(position: Option<Position>) -> String {
    position.map_or_else(|| "-".to_string(), |p| p.to_string())
}
