use std::sync::Arc;

use logstreams::stream::log_block_queue;
use logstreams::{
    AppendError, AppenderOptions, HealthStatus, ListLogStorage, LogBlock, LogBlockBuilder,
    LogReaderError, LogStorage, LogStorageAppender, LogStreamReader, LogStreamReaderOptions,
    LoggedEntry, SegmentedLogStorage, SegmentedLogStorageOptions,
};
use tempfile::TempDir;

fn block(positions: &[u64]) -> LogBlock {
    let mut builder = LogBlockBuilder::new();
    for &position in positions {
        let entry = LoggedEntry::new(position, position * 100, format!("payload-{}", position));
        builder.push(&entry).unwrap();
    }
    builder.build().unwrap()
}

fn new_reader(storage: Arc<dyn LogStorage>) -> LogStreamReader {
    LogStreamReader::new(storage, LogStreamReaderOptions::default()).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn read_all(reader: &mut LogStreamReader) -> Vec<u64> {
    reader.map(|entry| entry.unwrap().position).collect()
}

#[tokio::test]
async fn test_read_entries_of_a_single_block() {
    let storage = Arc::new(ListLogStorage::new());
    let (_writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());

    assert_eq!(appender.append(block(&[10, 11])).await.unwrap(), 11);

    let mut reader = new_reader(storage);
    assert!(reader.seek(10).unwrap());
    assert_eq!(reader.next_entry().unwrap().position, 10);

    let entry = reader.next_entry().unwrap();
    assert_eq!(entry.position, 11);
    assert_eq!(entry.key, 1100);
    assert_eq!(entry.payload, b"payload-11".to_vec());

    assert!(!reader.has_next().unwrap());
    assert!(matches!(
        reader.next_entry(),
        Err(LogReaderError::NoSuchElement)
    ));
}

#[tokio::test]
async fn test_blocks_from_queue_are_appended_in_order() {
    let storage = Arc::new(ListLogStorage::new());
    let (writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());
    let mut outcomes = appender.subscribe_outcomes();
    let mut committed = appender.committed_position();

    for start in [1, 4, 7] {
        writer.send(block(&[start, start + 1, start + 2])).await.unwrap();
    }
    committed.wait_for(|p| *p == Some(9)).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(outcome) = outcomes.try_recv() {
        seen.push(outcome.to_string());
    }
    assert_eq!(
        seen,
        vec![
            "Written(3)",
            "Committed(3)",
            "Written(6)",
            "Committed(6)",
            "Written(9)",
            "Committed(9)"
        ]
    );

    let mut reader = new_reader(storage);
    reader.seek_to_first_event().unwrap();
    assert_eq!(read_all(&mut reader), (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_seek_between_and_past_entries() {
    let storage = Arc::new(ListLogStorage::new());
    let (_writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());
    appender.append(block(&[2, 4, 6])).await.unwrap();
    appender.append(block(&[8, 10])).await.unwrap();

    let mut reader = new_reader(storage);
    assert!(reader.seek(5).unwrap());
    assert_eq!(read_all(&mut reader), vec![6, 8, 10]);

    assert!(!reader.seek(11).unwrap());
    assert_eq!(reader.seek_to_end().unwrap(), Some(10));
    assert!(!reader.has_next().unwrap());

    appender.append(block(&[12])).await.unwrap();
    assert!(reader.has_next().unwrap());
    assert_eq!(reader.next_entry().unwrap().position, 12);
}

#[tokio::test]
async fn test_failed_write_makes_appender_unhealthy() {
    let storage = Arc::new(ListLogStorage::new());
    let (_writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());
    let mut health = appender.subscribe_health();

    appender.append(block(&[5, 6])).await.unwrap();

    // positions must increase across blocks
    let result = appender.append(block(&[3])).await;
    assert!(matches!(result, Err(AppendError::Write(_))));

    health
        .wait_for(|report| report.status == HealthStatus::Unhealthy)
        .await
        .unwrap();
    assert!(!appender.is_healthy());
    assert!(appender.health_report().issue.is_some());

    let result = appender.append(block(&[7])).await;
    assert!(matches!(result, Err(AppendError::Unhealthy)));
    assert_eq!(storage.block_count(), 1);
}

#[tokio::test]
async fn test_concurrent_appends_commit_in_order() {
    let storage = Arc::new(ListLogStorage::new());
    let (_writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());

    let appends = (1..=20).map(|position| appender.append(block(&[position])));
    let results = futures::future::join_all(appends).await;
    let committed: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(committed, (1..=20).collect::<Vec<_>>());

    let mut reader = new_reader(storage);
    reader.seek_to_first_event().unwrap();
    assert_eq!(read_all(&mut reader), (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_segmented_storage_end_to_end() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let options = SegmentedLogStorageOptions {
        max_segment_size: 256,
        ..SegmentedLogStorageOptions::with_dir(temp_dir.path())
    };
    let storage = Arc::new(SegmentedLogStorage::open(options.clone()).unwrap());

    let (_writer, queue) = log_block_queue(16);
    let appender = LogStorageAppender::start(storage.clone(), queue, AppenderOptions::default());
    for start in (1..=100).step_by(5) {
        let positions: Vec<_> = (start..start + 5).collect();
        appender.append(block(&positions)).await.unwrap();
    }
    assert_eq!(*appender.committed_position().borrow(), Some(100));
    assert!(storage.segment_count() > 1);

    let options_small = LogStreamReaderOptions {
        initial_capacity: 16,
        ..Default::default()
    };
    let mut reader = LogStreamReader::new(storage.clone(), options_small).unwrap();
    assert!(reader.seek(42).unwrap());
    assert_eq!(read_all(&mut reader), (42..=100).collect::<Vec<_>>());
    assert!(reader.buffer_capacity() > 16);

    appender.close().await;
    drop(appender);
    drop(reader);
    drop(storage);

    let reopened: Arc<dyn LogStorage> = Arc::new(SegmentedLogStorage::open(options).unwrap());
    assert_eq!(reopened.commit_position(), Some(100));

    let mut reader = new_reader(reopened);
    assert_eq!(reader.seek_to_end().unwrap(), Some(100));
}
