//! Seekable, forward-only cursor over the committed entries of a [`LogStorage`].

use std::sync::Arc;

use tracing::debug;

use crate::error::LogReaderError;
use crate::traits::{BlockRead, LogStorage, LogStorageReader, ReaderResult};
use crate::types::{LoggedEntry, Position};

use super::frame::decode_frame;

/// Hard ceiling for the read buffer (128 MiB).
pub const MAX_BUFFER_CAPACITY: usize = 128 * 1024 * 1024;

pub const DEFAULT_INITIAL_CAPACITY: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct LogStreamReaderOptions {
    /// Initial read buffer size; grows on demand.
    pub initial_capacity: usize,
    /// Largest buffer the reader may grow to, at most [`MAX_BUFFER_CAPACITY`].
    pub max_capacity: usize,
}

impl Default for LogStreamReaderOptions {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_capacity: MAX_BUFFER_CAPACITY,
        }
    }
}

impl LogStreamReaderOptions {
    pub fn with_initial_capacity(initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            ..Default::default()
        }
    }
}

/// Reader over a partition log.
///
/// Callers position the reader with one of the seek methods and then consume entries with
/// [`has_next`](Self::has_next) and [`next_entry`](Self::next_entry). Any call other than a seek
/// fails with [`LogReaderError::NotInitialized`] before the first seek and after
/// [`close`](Self::close).
pub struct LogStreamReader {
    storage: Arc<dyn LogStorage>,
    max_capacity: usize,
    storage_reader: Option<Box<dyn LogStorageReader>>,
    buffer: Vec<u8>,
    /// Valid bytes of the current block in `buffer`.
    block_len: usize,
    /// Offset of the next frame in the current block.
    offset: usize,
    /// Entry read ahead by `has_next` or a seek.
    peeked: Option<LoggedEntry>,
    last_position: Option<Position>,
}

impl LogStreamReader {
    pub fn new(storage: Arc<dyn LogStorage>, options: LogStreamReaderOptions) -> ReaderResult<Self> {
        if options.max_capacity > MAX_BUFFER_CAPACITY {
            return Err(LogReaderError::InvalidCapacity {
                capacity: options.max_capacity,
                max: MAX_BUFFER_CAPACITY,
            });
        }
        if options.initial_capacity > options.max_capacity {
            return Err(LogReaderError::InvalidCapacity {
                capacity: options.initial_capacity,
                max: options.max_capacity,
            });
        }

        Ok(Self {
            storage,
            max_capacity: options.max_capacity,
            storage_reader: None,
            buffer: vec![0u8; options.initial_capacity],
            block_len: 0,
            offset: 0,
            peeked: None,
            last_position: None,
        })
    }

    /// Positions the reader on the first entry with a position `>= position`, clamping to the
    /// first entry. Returns whether an entry is available.
    pub fn seek(&mut self, position: Position) -> ReaderResult<bool> {
        self.reset_block();
        self.last_position = None;

        let mut reader = match self.storage_reader.take() {
            Some(reader) => reader,
            None => self.storage.new_reader()?,
        };
        // stays uninitialized until a seek succeeds
        reader.seek(position)?;
        self.storage_reader = Some(reader);

        while let Some(entry) = self.read_next()? {
            if entry.position >= position {
                self.peeked = Some(entry);
                break;
            }
        }

        Ok(self.peeked.is_some())
    }

    pub fn seek_to_first_event(&mut self) -> ReaderResult<bool> {
        self.seek(0)
    }

    /// Moves past the last committed entry and returns its position, `None` for an empty log.
    /// `has_next` is false right after, until more entries are committed.
    pub fn seek_to_end(&mut self) -> ReaderResult<Option<Position>> {
        let target = self.storage.commit_position().unwrap_or(0);
        self.seek(target)?;

        let mut last = None;
        while let Some(entry) = self.take_next()? {
            last = Some(entry.position);
        }
        self.last_position = last;
        Ok(last)
    }

    pub fn has_next(&mut self) -> ReaderResult<bool> {
        self.ensure_initialized()?;
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Returns the next entry, or [`LogReaderError::NoSuchElement`] if there is none.
    pub fn next_entry(&mut self) -> ReaderResult<LoggedEntry> {
        self.ensure_initialized()?;
        let entry = self.take_next()?.ok_or(LogReaderError::NoSuchElement)?;
        self.last_position = Some(entry.position);
        Ok(entry)
    }

    /// Position of the entry returned last.
    pub fn position(&self) -> Option<Position> {
        self.last_position
    }

    /// Releases the storage cursor. Only a seek re-initializes the reader.
    pub fn close(&mut self) {
        self.storage_reader = None;
        self.reset_block();
        self.last_position = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.storage_reader.is_some()
    }

    /// Current read buffer size.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_initialized(&self) -> ReaderResult<()> {
        if self.storage_reader.is_none() {
            return Err(LogReaderError::NotInitialized);
        }
        Ok(())
    }

    fn reset_block(&mut self) {
        self.block_len = 0;
        self.offset = 0;
        self.peeked = None;
    }

    fn take_next(&mut self) -> ReaderResult<Option<LoggedEntry>> {
        match self.peeked.take() {
            Some(entry) => Ok(Some(entry)),
            None => self.read_next(),
        }
    }

    /// Decodes the next frame, loading the next block when the current one is consumed.
    fn read_next(&mut self) -> ReaderResult<Option<LoggedEntry>> {
        loop {
            if self.offset < self.block_len {
                let (entry, next) = decode_frame(&self.buffer[..self.block_len], self.offset)?;
                self.offset = next;
                return Ok(Some(entry));
            }

            if !self.read_block()? {
                return Ok(None);
            }
        }
    }

    fn read_block(&mut self) -> ReaderResult<bool> {
        let reader = self
            .storage_reader
            .as_mut()
            .ok_or(LogReaderError::NotInitialized)?;

        loop {
            match reader.read_block(&mut self.buffer)? {
                BlockRead::Block { len } => {
                    self.block_len = len;
                    self.offset = 0;
                    return Ok(true);
                }
                BlockRead::NoData => return Ok(false),
                BlockRead::InsufficientCapacity { required } => {
                    grow_buffer(&mut self.buffer, required, self.max_capacity)?;
                }
            }
        }
    }
}

/// Doubles the buffer, or grows it to exactly fit `required` if doubling is not enough.
fn grow_buffer(buffer: &mut Vec<u8>, required: usize, max_capacity: usize) -> ReaderResult<()> {
    if required > max_capacity {
        return Err(LogReaderError::BlockExceedsMaxCapacity {
            required,
            max: max_capacity,
        });
    }

    let new_capacity = buffer.len().saturating_mul(2).max(required).min(max_capacity);
    debug!(
        "Growing reader buffer: from={}, to={}, required={}",
        buffer.len(),
        new_capacity,
        required
    );
    buffer.resize(new_capacity, 0);
    Ok(())
}

impl Iterator for LogStreamReader {
    type Item = ReaderResult<LoggedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(self.next_entry()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogStorageError;
    use crate::storage::log::ListLogStorage;
    use crate::stream::frame::LogBlockBuilder;
    use crate::traits::{PendingAppend, StorageResult};

    fn entry(position: Position) -> LoggedEntry {
        LoggedEntry::new(position, position % 3, format!("value_{}", position).into_bytes())
    }

    fn append_block(storage: &ListLogStorage, positions: &[Position]) {
        let mut builder = LogBlockBuilder::new();
        for &position in positions {
            builder.push(&entry(position)).unwrap();
        }
        let (lowest, highest, data) = builder.build().unwrap().into_parts();
        storage.append(lowest, highest, data);
    }

    fn reader_over(storage: &ListLogStorage) -> LogStreamReader {
        LogStreamReader::new(Arc::new(storage.clone()), LogStreamReaderOptions::default()).unwrap()
    }

    fn positions(reader: &mut LogStreamReader) -> Vec<Position> {
        reader.map(|e| e.unwrap().position).collect()
    }

    #[test]
    fn test_read_before_seek_is_not_initialized() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1]);
        let mut reader = reader_over(&storage);

        assert!(matches!(
            reader.has_next(),
            Err(LogReaderError::NotInitialized)
        ));
        assert!(matches!(
            reader.next_entry(),
            Err(LogReaderError::NotInitialized)
        ));
    }

    #[test]
    fn test_seek_to_first_event_reads_everything_in_order() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1, 2, 3]);
        append_block(&storage, &[4]);
        append_block(&storage, &[5, 6]);

        let mut reader = reader_over(&storage);
        assert!(reader.seek_to_first_event().unwrap());
        assert_eq!(positions(&mut reader), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(reader.position(), Some(6));
    }

    #[test]
    fn test_seek_inside_block_and_between_positions() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[10, 11, 12]);
        append_block(&storage, &[20, 21]);

        let mut reader = reader_over(&storage);

        assert!(reader.seek(11).unwrap());
        assert_eq!(reader.next_entry().unwrap(), entry(11));

        // between two committed positions
        assert!(reader.seek(15).unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 20);

        // below the first entry clamps to the first entry
        assert!(reader.seek(3).unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 10);

        // beyond the last entry
        assert!(!reader.seek(100).unwrap());
        assert!(!reader.has_next().unwrap());
        assert!(matches!(
            reader.next_entry(),
            Err(LogReaderError::NoSuchElement)
        ));
    }

    #[test]
    fn test_seek_on_empty_log() {
        let storage = ListLogStorage::new();
        let mut reader = reader_over(&storage);

        assert!(!reader.seek_to_first_event().unwrap());
        assert_eq!(reader.seek_to_end().unwrap(), None);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn test_seek_to_end() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1, 2]);
        append_block(&storage, &[3, 4, 5]);

        let mut reader = reader_over(&storage);
        assert_eq!(reader.seek_to_end().unwrap(), Some(5));
        assert_eq!(reader.position(), Some(5));
        assert!(!reader.has_next().unwrap());

        // new entries become visible to the exhausted reader
        append_block(&storage, &[6]);
        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 6);
    }

    #[test]
    fn test_close_requires_new_seek() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1, 2]);

        let mut reader = reader_over(&storage);
        assert!(reader.seek(1).unwrap());
        reader.close();

        assert!(!reader.is_initialized());
        assert!(matches!(
            reader.has_next(),
            Err(LogReaderError::NotInitialized)
        ));

        assert!(reader.seek(2).unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 2);
    }

    #[test]
    fn test_buffer_grows_to_fit_large_blocks() {
        let storage = ListLogStorage::new();
        let big = LoggedEntry::new(1, 0, vec![7u8; 5000]);
        let mut builder = LogBlockBuilder::new();
        builder.push(&big).unwrap();
        let (lowest, highest, data) = builder.build().unwrap().into_parts();
        let block_len = data.len();
        storage.append(lowest, highest, data);

        let mut reader = LogStreamReader::new(
            Arc::new(storage.clone()),
            LogStreamReaderOptions::with_initial_capacity(16),
        )
        .unwrap();

        assert!(reader.seek_to_first_event().unwrap());
        assert_eq!(reader.next_entry().unwrap(), big);
        // doubling 16 is not enough, so the buffer grows to exactly fit
        assert_eq!(reader.buffer_capacity(), block_len);
    }

    #[test]
    fn test_invalid_capacity_fails_at_construction() {
        let storage = ListLogStorage::new();
        let options = LogStreamReaderOptions {
            initial_capacity: MAX_BUFFER_CAPACITY + 1,
            ..Default::default()
        };
        assert!(matches!(
            LogStreamReader::new(Arc::new(storage.clone()), options),
            Err(LogReaderError::InvalidCapacity { .. })
        ));

        let options = LogStreamReaderOptions {
            initial_capacity: 64,
            max_capacity: 32,
        };
        assert!(matches!(
            LogStreamReader::new(Arc::new(storage), options),
            Err(LogReaderError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_block_exceeding_max_capacity_fails_read() {
        let storage = ListLogStorage::new();
        let mut builder = LogBlockBuilder::new();
        builder.push(&LoggedEntry::new(1, 0, vec![1u8; 512])).unwrap();
        let (lowest, highest, data) = builder.build().unwrap().into_parts();
        storage.append(lowest, highest, data);

        let options = LogStreamReaderOptions {
            initial_capacity: 64,
            max_capacity: 256,
        };
        let mut reader = LogStreamReader::new(Arc::new(storage), options).unwrap();

        assert!(matches!(
            reader.seek_to_first_event(),
            Err(LogReaderError::BlockExceedsMaxCapacity { max: 256, .. })
        ));
    }

    #[test]
    fn test_corrupted_block_stops_iteration() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1]);
        storage.append(2, 2, vec![0xAB; 32]);
        append_block(&storage, &[3]);

        let mut reader = reader_over(&storage);
        assert!(reader.seek_to_first_event().unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 1);

        assert!(matches!(
            reader.has_next(),
            Err(LogReaderError::CorruptedEntry(_))
        ));
        // never skips ahead
        assert!(reader.has_next().is_err());
    }

    /// Storage whose reader fails every read.
    struct BrokenStorage;

    struct BrokenReader;

    impl LogStorageReader for BrokenReader {
        fn seek(&mut self, _position: Position) -> StorageResult<()> {
            Ok(())
        }

        fn read_block(&mut self, _buf: &mut [u8]) -> StorageResult<BlockRead> {
            Err(LogStorageError::SegmentNotFound(7))
        }
    }

    impl LogStorage for BrokenStorage {
        fn append(&self, _lowest: Position, highest: Position, _block: Vec<u8>) -> PendingAppend {
            let (pending, completion) = PendingAppend::new(highest);
            completion.fail_write(LogStorageError::Closed);
            pending
        }

        fn new_reader(&self) -> StorageResult<Box<dyn LogStorageReader>> {
            Ok(Box::new(BrokenReader))
        }

        fn commit_position(&self) -> Option<Position> {
            Some(10)
        }
    }

    /// Reader over a list storage whose seeks fail after the first one.
    struct FlakySeekReader {
        inner: Box<dyn LogStorageReader>,
        seeks: usize,
    }

    impl LogStorageReader for FlakySeekReader {
        fn seek(&mut self, position: Position) -> StorageResult<()> {
            self.seeks += 1;
            if self.seeks > 1 {
                return Err(LogStorageError::SegmentNotFound(3));
            }
            self.inner.seek(position)
        }

        fn read_block(&mut self, buf: &mut [u8]) -> StorageResult<BlockRead> {
            self.inner.read_block(buf)
        }
    }

    struct FlakySeekStorage(ListLogStorage);

    impl LogStorage for FlakySeekStorage {
        fn append(&self, lowest: Position, highest: Position, block: Vec<u8>) -> PendingAppend {
            self.0.append(lowest, highest, block)
        }

        fn new_reader(&self) -> StorageResult<Box<dyn LogStorageReader>> {
            Ok(Box::new(FlakySeekReader {
                inner: self.0.new_reader()?,
                seeks: 0,
            }))
        }

        fn commit_position(&self) -> Option<Position> {
            self.0.commit_position()
        }
    }

    #[test]
    fn test_failed_seek_does_not_return_stale_entries() {
        let storage = ListLogStorage::new();
        append_block(&storage, &[1, 2]);
        append_block(&storage, &[4, 5]);

        let mut reader = LogStreamReader::new(
            Arc::new(FlakySeekStorage(storage)),
            LogStreamReaderOptions::default(),
        )
        .unwrap();
        assert!(reader.seek(1).unwrap());

        assert!(matches!(
            reader.seek(4),
            Err(LogReaderError::Storage(LogStorageError::SegmentNotFound(3)))
        ));
        assert!(!reader.is_initialized());
        assert_eq!(reader.position(), None);
        assert!(matches!(
            reader.has_next(),
            Err(LogReaderError::NotInitialized)
        ));
        assert!(matches!(
            reader.next_entry(),
            Err(LogReaderError::NotInitialized)
        ));

        // a fresh storage cursor recovers the reader
        assert!(reader.seek(4).unwrap());
        assert_eq!(reader.next_entry().unwrap().position, 4);
    }

    #[test]
    fn test_storage_errors_are_surfaced() {
        let mut reader =
            LogStreamReader::new(Arc::new(BrokenStorage), LogStreamReaderOptions::default())
                .unwrap();

        assert!(matches!(
            reader.seek(1),
            Err(LogReaderError::Storage(LogStorageError::SegmentNotFound(7)))
        ));
    }
}
