use std::fmt::{self, Display};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::traits::SnapshotResult;
use crate::types::Position;

pub const METADATA_FILE_NAME: &str = "snapshot.metadata";
pub const CHECKSUM_FILE_NAME: &str = "snapshot.checksum";

/// Files the store writes next to the snapshot content; never part of its checksum set.
pub const RESERVED_FILE_NAMES: [&str; 2] = [METADATA_FILE_NAME, CHECKSUM_FILE_NAME];

pub const METADATA_VERSION: u32 = 1;

/// Identity of a snapshot, ordered by index, term, processed position, exported position and
/// finally timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId {
    /// Consensus index the snapshot corresponds to.
    pub index: u64,
    pub term: u64,
    pub processed_position: Position,
    pub exported_position: Position,
    /// Milliseconds since the epoch; distinguishes forced snapshots at equal positions.
    pub timestamp: u64,
}

impl SnapshotId {
    pub fn new(
        index: u64,
        term: u64,
        processed_position: Position,
        exported_position: Position,
        timestamp: u64,
    ) -> Self {
        Self {
            index,
            term,
            processed_position,
            exported_position,
            timestamp,
        }
    }

    /// Everything but the timestamp.
    pub fn positions(&self) -> (u64, u64, Position, Position) {
        (
            self.index,
            self.term,
            self.processed_position,
            self.exported_position,
        )
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.exported_position, self.timestamp
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    /// Parses `index-term-processed-exported[-timestamp]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SnapshotError::InvalidState(format!("invalid snapshot id '{}'", s));

        let parts = s
            .split('-')
            .map(|part| part.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        match parts.as_slice() {
            [index, term, processed, exported] => {
                Ok(Self::new(*index, *term, *processed, *exported, 0))
            }
            [index, term, processed, exported, timestamp] => Ok(Self::new(
                *index, *term, *processed, *exported, *timestamp,
            )),
            _ => Err(invalid()),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Metadata stored as JSON in every snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub processed_position: Position,
    pub exported_position: Position,
    /// Last log position that must still exist for the snapshot to be recoverable.
    pub last_followup_event_position: Position,
}

impl SnapshotMetadata {
    pub fn for_id(id: &SnapshotId) -> Self {
        Self {
            version: METADATA_VERSION,
            processed_position: id.processed_position,
            exported_position: id.exported_position,
            last_followup_event_position: id.processed_position,
        }
    }

    pub fn write_to(&self, path: &Path) -> SnapshotResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            SnapshotError::Corrupted(format!("failed to serialize metadata: {}", e))
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> SnapshotResult<Self> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|e| {
            SnapshotError::Corrupted(format!("failed to parse metadata {:?}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_snapshot_id_string_round_trip() {
        let id = SnapshotId::new(5, 2, 100, 90, 1700);
        assert_eq!(id.to_string(), "5-2-100-90-1700");
        assert_eq!("5-2-100-90-1700".parse::<SnapshotId>().unwrap(), id);
    }

    #[test]
    fn test_snapshot_id_without_timestamp() {
        let id: SnapshotId = "5-2-100-90".parse().unwrap();
        assert_eq!(id, SnapshotId::new(5, 2, 100, 90, 0));
    }

    #[test]
    fn test_snapshot_id_rejects_garbage() {
        assert!("5-2-100".parse::<SnapshotId>().is_err());
        assert!("5-2-x-90".parse::<SnapshotId>().is_err());
        assert!("".parse::<SnapshotId>().is_err());
    }

    #[test]
    fn test_snapshot_id_order() {
        let base = SnapshotId::new(5, 2, 100, 90, 10);
        assert!(SnapshotId::new(6, 1, 0, 0, 0) > base);
        assert!(SnapshotId::new(5, 3, 0, 0, 0) > base);
        assert!(SnapshotId::new(5, 2, 101, 0, 0) > base);
        assert!(SnapshotId::new(5, 2, 100, 90, 11) > base);
        assert!(SnapshotId::new(5, 2, 100, 89, 99) < base);
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE_NAME);

        let mut metadata = SnapshotMetadata::for_id(&SnapshotId::new(1, 1, 10, 8, 0));
        metadata.last_followup_event_position = 15;
        metadata.write_to(&path).unwrap();

        assert_eq!(SnapshotMetadata::read_from(&path).unwrap(), metadata);
    }
}
