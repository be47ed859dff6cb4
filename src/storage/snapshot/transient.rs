use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;
use crate::types::Position;

use super::checksum::ChecksumSet;
use super::id::{RESERVED_FILE_NAMES, SnapshotId, SnapshotMetadata};
use super::persisted::PersistedSnapshot;
use super::store::{StoreHandle, StoreRequest, run_blocking};

/// A snapshot being written locally. Becomes visible only once [`persist`](Self::persist)
/// succeeds; dropping it unfinished aborts it.
#[derive(Debug)]
pub struct TransientSnapshot {
    id: SnapshotId,
    path: PathBuf,
    metadata: SnapshotMetadata,
    checksums: ChecksumSet,
    store: StoreHandle,
    completed: bool,
}

impl TransientSnapshot {
    pub(crate) fn new(id: SnapshotId, path: PathBuf, store: StoreHandle) -> Self {
        Self {
            metadata: SnapshotMetadata::for_id(&id),
            id,
            path,
            checksums: ChecksumSet::new(),
            store,
            completed: false,
        }
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Pending directory the writer fills.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Checksums of the files taken so far.
    pub fn checksums(&self) -> &ChecksumSet {
        &self.checksums
    }

    pub fn with_last_followup_event_position(&mut self, position: Position) -> &mut Self {
        self.metadata.last_followup_event_position = position;
        self
    }

    /// Lets `writer` add files to the snapshot directory. May be called several times; files
    /// written by an earlier call must stay untouched.
    pub async fn take<F>(&mut self, writer: F) -> SnapshotResult<()>
    where
        F: FnOnce(&Path) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_open()?;

        let path = self.path.clone();
        let previous = self.checksums.clone();
        let checksums = run_blocking(move || {
            if !path.is_dir() {
                return Err(SnapshotError::InvalidState(format!(
                    "snapshot directory {:?} no longer exists",
                    path
                )));
            }

            writer(&path).map_err(|e| {
                SnapshotError::Io(Arc::new(std::io::Error::other(format!(
                    "failed to write snapshot: {:#}",
                    e
                ))))
            })?;

            let actual = ChecksumSet::from_directory(&path, &RESERVED_FILE_NAMES)?;
            for (name, checksum) in previous.iter() {
                if actual.get(name) != Some(checksum) {
                    return Err(SnapshotError::Corrupted(format!(
                        "file {} changed after it was taken",
                        name
                    )));
                }
            }
            Ok(actual)
        })
        .await?;

        debug!(
            "Took snapshot files: id={}, files={}",
            self.id,
            checksums.len()
        );
        self.checksums = checksums;
        Ok(())
    }

    /// Verifies the written files and publishes the snapshot as the store's latest.
    pub async fn persist(&mut self) -> SnapshotResult<PersistedSnapshot> {
        self.ensure_open()?;

        let id = self.id;
        let checksums = self.checksums.clone();
        let metadata = self.metadata.clone();
        let snapshot = self
            .store
            .call(|reply| StoreRequest::PersistTransient {
                id,
                checksums,
                metadata,
                reply,
            })
            .await?;

        self.completed = true;
        Ok(snapshot)
    }

    /// Discards the snapshot and its directory.
    pub async fn abort(&mut self) -> SnapshotResult<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;

        let id = self.id;
        self.store
            .call(|reply| StoreRequest::AbortTransient {
                id,
                reply: Some(reply),
            })
            .await
    }

    fn ensure_open(&self) -> SnapshotResult<()> {
        if self.completed {
            return Err(SnapshotError::InvalidState(format!(
                "snapshot {} is already completed",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for TransientSnapshot {
    fn drop(&mut self) {
        if !self.completed {
            debug!("Aborting dropped transient snapshot: id={}", self.id);
            self.store.notify(StoreRequest::AbortTransient {
                id: self.id,
                reply: None,
            });
        }
    }
}
