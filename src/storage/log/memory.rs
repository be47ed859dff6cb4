use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::LogStorageError;
use crate::traits::{BlockRead, LogStorage, LogStorageReader, PendingAppend, StorageResult};
use crate::types::Position;

#[derive(Debug, Clone)]
struct StoredBlock {
    lowest: Position,
    highest: Position,
    data: Arc<Vec<u8>>,
}

/// 内存存储实现（用于测试和单机场景）
///
/// Every append is written and committed immediately.
#[derive(Clone, Default)]
pub struct ListLogStorage {
    blocks: Arc<RwLock<Vec<StoredBlock>>>, // 按位置递增
}

impl ListLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

impl LogStorage for ListLogStorage {
    fn append(&self, lowest: Position, highest: Position, block: Vec<u8>) -> PendingAppend {
        let (pending, completion) = PendingAppend::new(highest);

        let mut blocks = self.blocks.write();
        let last = blocks.last().map(|b| b.highest);
        if let Some(last) = last.filter(|&last| lowest <= last) {
            drop(blocks);
            completion.fail_write(LogStorageError::OutOfOrder {
                lowest,
                highest,
                last,
            });
            return pending;
        }

        blocks.push(StoredBlock {
            lowest,
            highest,
            data: Arc::new(block),
        });
        drop(blocks);

        let _ = completion.written.send(Ok(()));
        let _ = completion.committed.send(Ok(()));
        pending
    }

    fn new_reader(&self) -> StorageResult<Box<dyn LogStorageReader>> {
        Ok(Box::new(ListLogStorageReader {
            blocks: self.blocks.clone(),
            next: 0,
        }))
    }

    fn commit_position(&self) -> Option<Position> {
        self.blocks.read().last().map(|b| b.highest)
    }
}

struct ListLogStorageReader {
    blocks: Arc<RwLock<Vec<StoredBlock>>>,
    next: usize,
}

impl LogStorageReader for ListLogStorageReader {
    fn seek(&mut self, position: Position) -> StorageResult<()> {
        let blocks = self.blocks.read();
        let idx = blocks.partition_point(|b| b.lowest <= position);
        self.next = idx.saturating_sub(1);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> StorageResult<BlockRead> {
        let blocks = self.blocks.read();
        let Some(block) = blocks.get(self.next) else {
            return Ok(BlockRead::NoData);
        };

        let required = block.data.len();
        if required > buf.len() {
            return Ok(BlockRead::InsufficientCapacity { required });
        }

        buf[..required].copy_from_slice(&block.data);
        self.next += 1;
        Ok(BlockRead::Block { len: required })
    }
}
