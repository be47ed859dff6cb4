use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;

use super::checksum::ChecksumSet;
use super::chunk::SnapshotChunk;
use super::id::{CHECKSUM_FILE_NAME, METADATA_FILE_NAME, SnapshotId};
use super::persisted::PersistedSnapshot;
use super::store::{StoreHandle, StoreRequest, run_blocking};

/// A snapshot replicated from another node, assembled chunk by chunk.
#[derive(Debug)]
pub struct ReceivedSnapshot {
    id: SnapshotId,
    path: PathBuf,
    checksums: ChecksumSet,
    expected_checksum: Option<u64>,
    total_count: Option<u32>,
    received_count: u32,
    store: StoreHandle,
    completed: bool,
}

fn is_valid_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != CHECKSUM_FILE_NAME
        && !name.contains(['/', '\\'])
}

impl ReceivedSnapshot {
    pub(crate) fn new(id: SnapshotId, path: PathBuf, store: StoreHandle) -> Self {
        Self {
            id,
            path,
            checksums: ChecksumSet::new(),
            expected_checksum: None,
            total_count: None,
            received_count: 0,
            store,
            completed: false,
        }
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    /// Validates `chunk` and appends its content to the named file.
    pub async fn apply(&mut self, chunk: SnapshotChunk) -> SnapshotResult<()> {
        self.ensure_open()?;

        let chunk_id = chunk.snapshot_id.parse::<SnapshotId>()?;
        if chunk_id != self.id {
            return Err(SnapshotError::InvalidState(format!(
                "chunk of snapshot {} applied to snapshot {}",
                chunk.snapshot_id, self.id
            )));
        }
        if !is_valid_chunk_name(&chunk.chunk_name) {
            return Err(SnapshotError::Corrupted(format!(
                "invalid chunk name '{}'",
                chunk.chunk_name
            )));
        }
        if SnapshotChunk::content_checksum(&chunk.content) != chunk.checksum {
            return Err(SnapshotError::Corrupted(format!(
                "checksum mismatch for chunk {} at offset {}",
                chunk.chunk_name, chunk.file_block_position
            )));
        }
        if self
            .expected_checksum
            .is_some_and(|expected| expected != chunk.snapshot_checksum)
            || self
                .total_count
                .is_some_and(|total| total != chunk.total_count)
        {
            return Err(SnapshotError::Corrupted(format!(
                "chunk {} disagrees with earlier chunks of snapshot {}",
                chunk.chunk_name, self.id
            )));
        }

        let file_path = self.path.join(&chunk.chunk_name);
        let offset = chunk.file_block_position;
        let end = offset + chunk.content.len() as u64;
        if end > chunk.total_file_size {
            return Err(SnapshotError::Corrupted(format!(
                "chunk {} ends at {} beyond file size {}",
                chunk.chunk_name, end, chunk.total_file_size
            )));
        }

        let content = chunk.content;
        let content = run_blocking(move || {
            let current = match fs::metadata(&file_path) {
                Ok(metadata) => metadata.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            if current != offset {
                return Err(SnapshotError::Corrupted(format!(
                    "chunk for {:?} expected at offset {}, file has {} bytes",
                    file_path, offset, current
                )));
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)?;
            file.write_all(&content)?;
            Ok(content)
        })
        .await?;

        if chunk.chunk_name != METADATA_FILE_NAME {
            self.checksums.update(&chunk.chunk_name, &content);
        }
        self.expected_checksum = Some(chunk.snapshot_checksum);
        self.total_count = Some(chunk.total_count);
        self.received_count += 1;

        debug!(
            "Applied snapshot chunk: id={}, name={}, offset={}, len={}",
            self.id,
            chunk.chunk_name,
            offset,
            content.len()
        );
        Ok(())
    }

    /// Verifies that every chunk arrived intact and publishes the snapshot.
    pub async fn persist(&mut self) -> SnapshotResult<PersistedSnapshot> {
        self.ensure_open()?;

        let (Some(expected_checksum), Some(total_count)) =
            (self.expected_checksum, self.total_count)
        else {
            return Err(SnapshotError::Corrupted(format!(
                "no chunks received for snapshot {}",
                self.id
            )));
        };
        if self.received_count != total_count {
            return Err(SnapshotError::Corrupted(format!(
                "received {} of {} chunks for snapshot {}",
                self.received_count, total_count, self.id
            )));
        }

        let id = self.id;
        let checksums = self.checksums.clone();
        let snapshot = self
            .store
            .call(|reply| StoreRequest::PersistReceived {
                id,
                checksums,
                expected_checksum,
                reply,
            })
            .await?;

        self.completed = true;
        Ok(snapshot)
    }

    pub async fn abort(&mut self) -> SnapshotResult<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;

        let id = self.id;
        self.store
            .call(|reply| StoreRequest::AbortReceived {
                id,
                reply: Some(reply),
            })
            .await
    }

    fn ensure_open(&self) -> SnapshotResult<()> {
        if self.completed {
            return Err(SnapshotError::InvalidState(format!(
                "received snapshot {} is already completed",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for ReceivedSnapshot {
    fn drop(&mut self) {
        if !self.completed {
            debug!("Aborting dropped received snapshot: id={}", self.id);
            self.store.notify(StoreRequest::AbortReceived {
                id: self.id,
                reply: None,
            });
        }
    }
}
