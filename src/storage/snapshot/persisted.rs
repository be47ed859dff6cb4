use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::traits::SnapshotResult;
use crate::types::Position;

use super::checksum::ChecksumSet;
use super::chunk::SnapshotChunkReader;
use super::id::{SnapshotId, SnapshotMetadata};
use super::reservation::{Reservation, ReservationReason};
use super::store::{StoreHandle, StoreRequest};

/// A snapshot published by the store. Immutable; cloning is cheap.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    id: SnapshotId,
    path: PathBuf,
    metadata: SnapshotMetadata,
    checksums: Arc<ChecksumSet>,
    store: StoreHandle,
}

impl PersistedSnapshot {
    pub(crate) fn new(
        id: SnapshotId,
        path: PathBuf,
        metadata: SnapshotMetadata,
        checksums: ChecksumSet,
        store: StoreHandle,
    ) -> Self {
        Self {
            id,
            path,
            metadata,
            checksums: Arc::new(checksums),
            store,
        }
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn index(&self) -> u64 {
        self.id.index
    }

    pub fn term(&self) -> u64 {
        self.id.term
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn checksums(&self) -> &ChecksumSet {
        &self.checksums
    }

    /// Combined checksum over all content files.
    pub fn checksum(&self) -> u64 {
        self.checksums.combined_checksum()
    }

    /// Log position below which entries are no longer needed to recover from this snapshot.
    pub fn compaction_bound(&self) -> Position {
        self.id
            .processed_position
            .min(self.id.exported_position)
            .min(self.metadata.last_followup_event_position)
    }

    /// Content files of the snapshot, sorted by name.
    pub fn files(&self) -> Vec<PathBuf> {
        self.checksums
            .names()
            .map(|name| self.path.join(name))
            .collect()
    }

    /// Pins this snapshot for the store's default lease.
    pub async fn reserve(&self, reason: ReservationReason) -> SnapshotResult<Reservation> {
        self.reserve_with(reason, None).await
    }

    pub async fn reserve_until(
        &self,
        reason: ReservationReason,
        valid_until: SystemTime,
    ) -> SnapshotResult<Reservation> {
        self.reserve_with(reason, Some(valid_until)).await
    }

    async fn reserve_with(
        &self,
        reason: ReservationReason,
        valid_until: Option<SystemTime>,
    ) -> SnapshotResult<Reservation> {
        let id = self.id;
        let (reservation_id, valid_until) = self
            .store
            .call(|reply| StoreRequest::Reserve {
                id,
                reason,
                valid_until,
                reply,
            })
            .await?;

        Ok(Reservation::new(
            reservation_id,
            id,
            reason,
            valid_until,
            self.store.clone(),
        ))
    }

    pub async fn is_reserved(&self) -> SnapshotResult<bool> {
        let id = self.id;
        self.store
            .call(|reply| StoreRequest::IsReserved { id, reply })
            .await
    }

    /// Streams the snapshot as chunks of at most `max_chunk_size` bytes.
    pub fn chunk_reader(&self, max_chunk_size: usize) -> SnapshotResult<SnapshotChunkReader> {
        SnapshotChunkReader::new(self, max_chunk_size)
    }
}

impl PartialEq for PersistedSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.path == other.path
    }
}

impl Eq for PersistedSnapshot {}
