use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;

use super::id::METADATA_FILE_NAME;
use super::persisted::PersistedSnapshot;

/// A piece of one snapshot file, as sent to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub snapshot_id: String,
    /// Number of chunks the whole snapshot is split into.
    pub total_count: u32,
    /// File the content belongs to.
    pub chunk_name: String,
    /// CRC32 of `content`.
    pub checksum: u64,
    pub content: Vec<u8>,
    /// Combined checksum of the snapshot's content files.
    pub snapshot_checksum: u64,
    /// Offset of `content` within its file.
    pub file_block_position: u64,
    pub total_file_size: u64,
}

impl SnapshotChunk {
    pub fn content_checksum(content: &[u8]) -> u64 {
        crc32fast::hash(content) as u64
    }
}

/// Iterates the files of a persisted snapshot in name order, splitting each into chunks.
///
/// Every file yields at least one chunk, so empty files are replicated too. The metadata file
/// is sent along; the checksum file is rebuilt by the receiver.
#[derive(Debug)]
pub struct SnapshotChunkReader {
    snapshot_id: String,
    dir: PathBuf,
    files: Vec<(String, u64)>,
    file_index: usize,
    offset: u64,
    max_chunk_size: usize,
    total_count: u32,
    snapshot_checksum: u64,
}

impl SnapshotChunkReader {
    pub(crate) fn new(snapshot: &PersistedSnapshot, max_chunk_size: usize) -> SnapshotResult<Self> {
        if max_chunk_size == 0 {
            return Err(SnapshotError::InvalidState(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let dir = snapshot.path().to_path_buf();
        let mut names: Vec<String> = snapshot.checksums().names().map(String::from).collect();
        if dir.join(METADATA_FILE_NAME).is_file() {
            names.push(METADATA_FILE_NAME.to_string());
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        let mut total_count = 0u32;
        for name in names {
            let size = fs::metadata(dir.join(&name))?.len();
            total_count += size.div_ceil(max_chunk_size as u64).max(1) as u32;
            files.push((name, size));
        }

        Ok(Self {
            snapshot_id: snapshot.id().to_string(),
            dir,
            files,
            file_index: 0,
            offset: 0,
            max_chunk_size,
            total_count,
            snapshot_checksum: snapshot.checksum(),
        })
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    pub fn snapshot_checksum(&self) -> u64 {
        self.snapshot_checksum
    }

    fn read_chunk(&self, name: &str, size: u64) -> SnapshotResult<Vec<u8>> {
        let len = (size - self.offset).min(self.max_chunk_size as u64) as usize;
        let mut content = vec![0u8; len];
        if len > 0 {
            let file = File::open(self.dir.join(name))?;
            file.read_exact_at(&mut content, self.offset)?;
        }
        Ok(content)
    }
}

impl Iterator for SnapshotChunkReader {
    type Item = SnapshotResult<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, size) = self.files.get(self.file_index)?.clone();

        let content = match self.read_chunk(&name, size) {
            Ok(content) => content,
            Err(e) => {
                self.file_index = self.files.len();
                return Some(Err(e));
            }
        };

        let chunk = SnapshotChunk {
            snapshot_id: self.snapshot_id.clone(),
            total_count: self.total_count,
            chunk_name: name,
            checksum: SnapshotChunk::content_checksum(&content),
            snapshot_checksum: self.snapshot_checksum,
            file_block_position: self.offset,
            total_file_size: size,
            content,
        };

        self.offset += chunk.content.len() as u64;
        if self.offset >= size {
            self.file_index += 1;
            self.offset = 0;
        }
        Some(Ok(chunk))
    }
}
