use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorHandler, LogStorageError};
use crate::traits::{
    AppendCompletion, BlockRead, LogStorage, LogStorageReader, PendingAppend, StorageResult,
};
use crate::types::Position;

use super::manager::{BlockCursor, DiskStats, SegmentManager, SegmentedLogStorageOptions};

pub struct AppendRequest {
    pub lowest: Position,
    pub highest: Position,
    pub block: Vec<u8>,
    pub completion: AppendCompletion,
}

/// File based [`LogStorage`] with automatic segment management.
///
/// All appends go through a single task that batches consecutive requests: every block of a
/// batch is written (and acknowledged as written) in order, then the active segment is flushed
/// once and the whole batch is acknowledged as committed.
#[derive(Clone)]
pub struct SegmentedLogStorage {
    manager: Arc<SegmentManager>,
    op_sender: mpsc::UnboundedSender<AppendRequest>,
}

impl SegmentedLogStorage {
    /// Opens the storage and starts its append task. Must be called inside a tokio runtime.
    pub fn open(options: SegmentedLogStorageOptions) -> StorageResult<Self> {
        let manager = Arc::new(SegmentManager::new(options)?);
        info!("Opened segmented log: {}", manager.disk_stats());
        let (tx, rx) = mpsc::unbounded_channel();

        let storage = Self {
            manager,
            op_sender: tx,
        };
        storage.start(rx);
        Ok(storage)
    }

    fn start(&self, mut receiver: mpsc::UnboundedReceiver<AppendRequest>) {
        let manager = self.manager.clone();
        let batch_size = manager.options().batch_size.max(1);

        tokio::spawn(async move {
            // once a write or flush failed nothing may be appended after the gap
            let mut failure: Option<LogStorageError> = None;

            loop {
                let mut buf = Vec::with_capacity(batch_size);
                let size = receiver.recv_many(&mut buf, batch_size).await;
                if size == 0 {
                    debug!("Log storage append receiver closed");
                    break;
                }

                let mut written = Vec::with_capacity(buf.len());
                for req in buf {
                    if let Some(e) = &failure {
                        req.completion.fail_write(e.clone());
                        continue;
                    }

                    match manager.write_block(req.lowest, req.highest, &req.block) {
                        Ok(_) => {
                            let _ = req.completion.written.send(Ok(()));
                            written.push((req.highest, req.completion.committed));
                        }
                        Err(e) => {
                            e.report("Write block");
                            failure = Some(e.clone());
                            req.completion.fail_write(e);
                        }
                    }
                }

                let Some(&(highest, _)) = written.last() else {
                    continue;
                };

                let result = manager.commit(highest).map_err(|e| {
                    e.report("Commit block");
                    let e = LogStorageError::CommitFailed(highest, e.to_string());
                    failure = Some(e.clone());
                    e
                });

                for (_, committed) in written {
                    let _ = committed.send(result.clone());
                }
            }
        });
    }

    /// Deletes sealed segments entirely below the compaction bound.
    pub fn delete_until(&self, bound: Position) -> StorageResult<usize> {
        let removed = self.manager.delete_until(bound)?;
        if removed > 0 {
            debug!("Compacted log until {}: {}", bound, self.manager.disk_stats());
        }
        Ok(removed)
    }

    pub fn first_position(&self) -> Option<Position> {
        self.manager.first_position()
    }

    pub fn last_position(&self) -> Option<Position> {
        self.manager.last_position()
    }

    /// Get number of segments (active + sealed)
    pub fn segment_count(&self) -> usize {
        self.manager.segment_count()
    }

    /// Segment footprint and position range of the log.
    pub fn disk_stats(&self) -> DiskStats {
        self.manager.disk_stats()
    }
}

impl LogStorage for SegmentedLogStorage {
    fn append(&self, lowest: Position, highest: Position, block: Vec<u8>) -> PendingAppend {
        let (pending, completion) = PendingAppend::new(highest);
        let request = AppendRequest {
            lowest,
            highest,
            block,
            completion,
        };

        if let Err(e) = self.op_sender.send(request) {
            warn!("Failed to send append request: log storage closed");
            e.0.completion.fail_write(LogStorageError::Closed);
        }

        pending
    }

    fn new_reader(&self) -> StorageResult<Box<dyn LogStorageReader>> {
        let cursor = self.manager.first_cursor();
        Ok(Box::new(SegmentedLogStorageReader {
            manager: self.manager.clone(),
            cursor,
        }))
    }

    fn commit_position(&self) -> Option<Position> {
        self.manager.commit_position()
    }
}

/// Block cursor over the committed blocks of a [`SegmentedLogStorage`].
pub struct SegmentedLogStorageReader {
    manager: Arc<SegmentManager>,
    cursor: BlockCursor,
}

impl LogStorageReader for SegmentedLogStorageReader {
    fn seek(&mut self, position: Position) -> StorageResult<()> {
        self.cursor = self.manager.seek(position);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> StorageResult<BlockRead> {
        self.manager.read_block(&mut self.cursor, buf)
    }
}
