use std::fs;
use std::sync::Arc;

use logstreams::storage::snapshot::{ChecksumSet, RESERVED_FILE_NAMES};
use logstreams::{
    FileBasedSnapshotStore, LogBlockBuilder, LogStorage, LogStreamReader, LogStreamReaderOptions,
    LoggedEntry, PersistedSnapshot, ReservationReason, SegmentedLogStorage,
    SegmentedLogStorageOptions, SnapshotError, SnapshotStoreOptions,
};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> FileBasedSnapshotStore {
    FileBasedSnapshotStore::open(SnapshotStoreOptions::with_root_dir(dir.path())).unwrap()
}

async fn take(
    store: &FileBasedSnapshotStore,
    (index, term, processed, exported): (u64, u64, u64, u64),
    force: bool,
) -> Result<PersistedSnapshot, SnapshotError> {
    let mut transient = store
        .new_transient_snapshot(index, term, processed, exported, force)
        .await?;
    transient
        .take(move |path| {
            fs::write(path.join("runtime.db"), format!("runtime-{}", processed))?;
            fs::write(path.join("zeebe.state"), format!("state-{}", exported))?;
            Ok(())
        })
        .await?;
    transient.persist().await
}

#[tokio::test]
async fn test_forced_snapshot_at_same_positions() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);

    let first = take(&store, (5, 2, 100, 90), false).await.unwrap();

    let result = store.new_transient_snapshot(5, 2, 100, 90, false).await;
    assert!(matches!(result, Err(SnapshotError::AlreadyExists(_))));

    let forced = take(&store, (5, 2, 100, 90), true).await.unwrap();
    assert!(forced.id() > first.id());
    assert_eq!(store.latest_snapshot(), Some(forced));
}

#[tokio::test]
async fn test_reservation_keeps_older_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);

    let old = take(&store, (5, 2, 100, 90), false).await.unwrap();
    let reservation = old.reserve(ReservationReason::Backup).await.unwrap();

    let new = take(&store, (8, 2, 160, 150), false).await.unwrap();
    assert_eq!(store.latest_snapshot(), Some(new.clone()));
    assert!(old.path().exists());
    assert_eq!(store.compaction_bound().await.unwrap(), Some(90));

    reservation.release().await.unwrap();
    assert!(!old.path().exists());
    assert_eq!(store.compaction_bound().await.unwrap(), Some(150));
    assert_eq!(store.available_snapshots().await.unwrap(), vec![new]);

    // a second release has no further effect
    reservation.release().await.unwrap();
}

#[tokio::test]
async fn test_persisted_checksums_match_files() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let snapshot = take(&store, (1, 1, 10, 10), false).await.unwrap();

    let recomputed = ChecksumSet::from_directory(snapshot.path(), &RESERVED_FILE_NAMES).unwrap();
    assert!(recomputed.same_checksums(snapshot.checksums()));
    assert_eq!(recomputed.combined_checksum(), snapshot.checksum());

    let files: Vec<_> = snapshot
        .files()
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(files, vec!["runtime.db", "zeebe.state"]);
}

#[tokio::test]
async fn test_reserve_snapshot_removed_out_of_band() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let snapshot = take(&store, (1, 1, 10, 10), false).await.unwrap();

    fs::remove_dir_all(snapshot.path()).unwrap();

    let result = snapshot.reserve(ReservationReason::ScaleUp).await;
    assert!(matches!(result, Err(SnapshotError::NotFound(_))));
}

#[tokio::test]
async fn test_stores_are_independent() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let first = open_store(&first_dir);
    let second = open_store(&second_dir);

    take(&first, (3, 1, 30, 30), false).await.unwrap();
    assert!(first.latest_snapshot().is_some());
    assert!(second.latest_snapshot().is_none());
    take(&second, (1, 1, 10, 10), false).await.unwrap();
}

#[tokio::test]
async fn test_compaction_keeps_entries_after_processed_position() {
    let log_dir = TempDir::new().unwrap();
    let options = SegmentedLogStorageOptions {
        max_segment_size: 1,
        sync_on_write: false,
        ..SegmentedLogStorageOptions::with_dir(log_dir.path())
    };
    let log = Arc::new(SegmentedLogStorage::open(options).unwrap());
    for position in 1..=100 {
        let mut builder = LogBlockBuilder::new();
        builder
            .push(&LoggedEntry::new(position, position, format!("event-{}", position)))
            .unwrap();
        let (lowest, highest, data) = builder.build().unwrap().into_parts();
        log.append(lowest, highest, data)
            .committed
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(log.segment_count(), 100);

    // consensus index far ahead of the processed log position
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    take(&store, (500, 1, 10, 10), false).await.unwrap();

    let bound = store.compaction_bound().await.unwrap().unwrap();
    assert_eq!(bound, 10);
    assert_eq!(log.delete_until(bound).unwrap(), 9);
    assert_eq!(log.first_position(), Some(10));

    let mut reader = LogStreamReader::new(log, LogStreamReaderOptions::default()).unwrap();
    assert!(reader.seek(11).unwrap());
    let replayed: Vec<_> = reader.map(|entry| entry.unwrap().position).collect();
    assert_eq!(replayed, (11..=100).collect::<Vec<_>>());
}
