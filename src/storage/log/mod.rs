//! Log storage implementations.
//!
//! Blocks handed to the storage are opaque framed bytes identified by their inclusive position
//! range. The segmented storage appends them to rolling segment files; the list storage keeps
//! them in memory.
//!
//! # Module Structure
//!
//! - `entry`: Block header and block metadata
//! - `segment`: Log segment file operations
//! - `manager`: Multi-segment management with rotation and compaction
//! - `store`: The segmented storage task and its reader
//! - `memory`: In-memory storage

mod entry;
mod manager;
mod memory;
mod segment;
mod store;


pub use entry::{BLOCK_HEADER_SIZE, BLOCK_MAGIC_NUM, BlockHeader, BlockMeta};

pub use manager::{
    DEFAULT_MAX_SEGMENT_SIZE, DiskStats, SegmentManager, SegmentedLogStorageOptions,
};

pub use memory::ListLogStorage;

pub use segment::LogSegment;

pub use store::{AppendRequest, SegmentedLogStorage, SegmentedLogStorageReader};
