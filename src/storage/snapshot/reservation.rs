use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tracing::debug;

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;

use super::id::SnapshotId;
use super::store::{StoreHandle, StoreRequest};

/// Why a snapshot was pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationReason {
    ScaleUp,
    Backup,
    Unknown,
}

/// Pins a snapshot against purging until released or until its lease expires.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    snapshot_id: SnapshotId,
    reason: ReservationReason,
    valid_until: SystemTime,
    released: AtomicBool,
    store: StoreHandle,
}

impl Reservation {
    pub(crate) fn new(
        id: u64,
        snapshot_id: SnapshotId,
        reason: ReservationReason,
        valid_until: SystemTime,
        store: StoreHandle,
    ) -> Self {
        Self {
            id,
            snapshot_id,
            reason,
            valid_until,
            released: AtomicBool::new(false),
            store,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot_id
    }

    pub fn reason(&self) -> ReservationReason {
        self.reason
    }

    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.valid_until
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Gives the snapshot up. Releasing twice is a no-op. A failed release leaves the
    /// reservation in place and may be retried.
    pub async fn release(&self) -> SnapshotResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let id = self.snapshot_id;
        let reservation_id = self.id;
        match self
            .store
            .call(|reply| StoreRequest::Release {
                id,
                reservation_id,
                reply,
            })
            .await
        {
            Err(SnapshotError::StateClosed) => {
                debug!(
                    "Snapshot store closed before release: snapshot={}, reservation={}",
                    id, reservation_id
                );
                Ok(())
            }
            Err(e) => {
                self.released.store(false, Ordering::Release);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }
}
