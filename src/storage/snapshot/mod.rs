//! File-based snapshot storage for one partition.
//!
//! A snapshot is a directory of opaque files written by the state machine, plus a JSON metadata
//! file and an SFV checksum file written by the store. Snapshots are built in a pending
//! directory and become visible with a single rename.
//!
//! # Directory Structure
//!
//! ```text
//! {root_dir}/
//! ├── snapshots/
//! │   └── {index}-{term}-{processed}-{exported}-{timestamp}/
//! │       ├── ...                 # Content files
//! │       ├── snapshot.metadata   # Positions and version (JSON)
//! │       └── snapshot.checksum   # Per-file CRC32 (SFV)
//! ├── pending/                    # Transient and received snapshots
//! └── bootstrap-snapshots/        # Copies with index and term 0
//! ```
//!
//! # Features
//!
//! - Only the latest snapshot and reserved ones are kept
//! - Checksum verification on load and before publishing
//! - Chunked replication to other nodes
//! - Bootstrap copies for new partitions

mod bootstrap;
mod checksum;
mod chunk;
mod id;
mod persisted;
mod received;
mod reservation;
mod store;
mod transient;


pub use bootstrap::copy_all_except;
pub use checksum::{ChecksumSet, file_checksum};
pub use chunk::{SnapshotChunk, SnapshotChunkReader};
pub use id::{
    CHECKSUM_FILE_NAME, METADATA_FILE_NAME, METADATA_VERSION, RESERVED_FILE_NAMES, SnapshotId,
    SnapshotMetadata,
};
pub use persisted::PersistedSnapshot;
pub use received::ReceivedSnapshot;
pub use reservation::{Reservation, ReservationReason};
pub use store::{FileBasedSnapshotStore, SnapshotStoreOptions};
pub use transient::TransientSnapshot;
