use tokio::sync::oneshot;

use crate::error::{LogReaderError, LogStorageError, SnapshotError};
use crate::types::Position;

// 结果类型别名
pub type StorageResult<T> = Result<T, LogStorageError>;
pub type ReaderResult<T> = Result<T, LogReaderError>;
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Completion handles for one block handed to [`LogStorage::append`].
///
/// `written` resolves once the block is durable, `committed` once it may be read.
/// Storages resolve the handles of consecutive appends in append order.
pub struct PendingAppend {
    pub highest_position: Position,
    pub written: oneshot::Receiver<StorageResult<()>>,
    pub committed: oneshot::Receiver<StorageResult<()>>,
}

/// Sender half that a storage implementation keeps for each pending block.
pub struct AppendCompletion {
    pub written: oneshot::Sender<StorageResult<()>>,
    pub committed: oneshot::Sender<StorageResult<()>>,
}

impl PendingAppend {
    pub fn new(highest_position: Position) -> (Self, AppendCompletion) {
        let (written_tx, written_rx) = oneshot::channel();
        let (committed_tx, committed_rx) = oneshot::channel();
        (
            Self {
                highest_position,
                written: written_rx,
                committed: committed_rx,
            },
            AppendCompletion {
                written: written_tx,
                committed: committed_tx,
            },
        )
    }
}

impl AppendCompletion {
    /// Reports a write failure; the commit handle sees the same failure.
    pub fn fail_write(self, error: LogStorageError) {
        let _ = self.written.send(Err(error.clone()));
        let _ = self.committed.send(Err(error));
    }
}

/// Result of copying the next block out of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRead {
    /// The block was copied into the first `len` bytes of the buffer.
    Block { len: usize },
    /// No committed block after the cursor.
    NoData,
    /// The buffer is too small; nothing was consumed.
    InsufficientCapacity { required: usize },
}

/// Physical log storage shared by one appender and many readers of a partition.
///
/// The block bytes are opaque to the storage; it only knows the inclusive position range.
pub trait LogStorage: Send + Sync + 'static {
    /// Hands a framed block to storage. Never blocks on I/O.
    fn append(&self, lowest: Position, highest: Position, block: Vec<u8>) -> PendingAppend;

    /// Opens a new cursor over committed blocks. Readers never mutate storage.
    fn new_reader(&self) -> StorageResult<Box<dyn LogStorageReader>>;

    /// Highest committed position, if anything was committed.
    fn commit_position(&self) -> Option<Position>;
}

/// Block cursor over a [`LogStorage`], transparently spanning its segments.
pub trait LogStorageReader: Send {
    /// Positions the cursor on the block containing `position`: the last block whose lowest
    /// position is `<= position`, or the first block if `position` is below all of them.
    fn seek(&mut self, position: Position) -> StorageResult<()>;

    /// Copies the next block into `buf` and advances, unless capacity is insufficient.
    fn read_block(&mut self, buf: &mut [u8]) -> StorageResult<BlockRead>;
}
