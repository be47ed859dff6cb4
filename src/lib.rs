//! Partition log streams and snapshot storage.
//!
//! - [`stream`]: appending framed entry blocks to a log storage and reading them back
//! - [`storage::log`]: segmented on-disk and in-memory log storages
//! - [`storage::snapshot`]: the file-based snapshot store

pub mod error;
pub mod storage;
pub mod stream;
pub mod traits;
pub mod types;

pub use error::{
    AppendError, ErrorHandler, ErrorSeverity, LogReaderError, LogStorageError, SnapshotError,
};
pub use storage::snapshot::{
    FileBasedSnapshotStore, PersistedSnapshot, ReceivedSnapshot, Reservation, ReservationReason,
    SnapshotChunk, SnapshotId, SnapshotStoreOptions, TransientSnapshot,
};
pub use storage::{ListLogStorage, SegmentedLogStorage, SegmentedLogStorageOptions};
pub use stream::{
    AppenderOptions, HealthReport, HealthStatus, LogBlock, LogBlockBuilder, LogStorageAppender,
    LogStreamReader, LogStreamReaderOptions,
};
pub use traits::{BlockRead, LogStorage, LogStorageReader, PendingAppend};
pub use types::{AppendOutcome, LoggedEntry, PartitionId, Payload, Position};
