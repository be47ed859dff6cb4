use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::Position;

/// 存储相关错误
///
/// Cloneable so that one failed batch can be reported to every request in it.
#[derive(Debug, Clone, Error)]
pub enum LogStorageError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Corrupted block in segment {segment_id} at offset {offset}: {reason}")]
    CorruptedBlock {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("Segment {0} not found")]
    SegmentNotFound(u64),

    #[error("Block [{lowest}, {highest}] does not follow last position {last}")]
    OutOfOrder {
        lowest: Position,
        highest: Position,
        last: Position,
    },

    #[error("Commit failed at position {0}: {1}")]
    CommitFailed(Position, String),

    #[error("Log storage closed")]
    Closed,
}

impl From<std::io::Error> for LogStorageError {
    fn from(e: std::io::Error) -> Self {
        LogStorageError::Io(Arc::new(e))
    }
}

/// Errors returned to callers of the appender.
#[derive(Debug, Clone, Error)]
pub enum AppendError {
    #[error("Failed to write block: {0}")]
    Write(LogStorageError),

    #[error("Failed to commit block up to position {position}: {source}")]
    Commit {
        position: Position,
        source: LogStorageError,
    },

    #[error("Appender is unhealthy and no longer accepts blocks")]
    Unhealthy,

    #[error("Appender closed")]
    Closed,

    #[error("Invalid block: {0}")]
    InvalidBlock(String),
}

/// Reader protocol violations and the storage faults surfaced through a read.
#[derive(Debug, Error)]
pub enum LogReaderError {
    #[error("Iterator not initialized, seek first")]
    NotInitialized,

    #[error("No next element")]
    NoSuchElement,

    #[error("Block of {required} bytes exceeds max buffer capacity of {max} bytes")]
    BlockExceedsMaxCapacity { required: usize, max: usize },

    #[error("Invalid buffer capacity {capacity} (max {max})")]
    InvalidCapacity { capacity: usize, max: usize },

    #[error("Corrupted entry: {0}")]
    CorruptedEntry(String),

    #[error("Storage error: {0}")]
    Storage(#[from] LogStorageError),
}

/// 快照相关错误
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("Snapshot {0} already exists")]
    AlreadyExists(String),

    #[error("Snapshot store closed")]
    StateClosed,

    #[error("Snapshot {0} not found")]
    NotFound(String),

    #[error("Snapshot corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to copy snapshot for bootstrap: {0}")]
    CopyForBootstrap(String),

    #[error("Snapshot {0} is already in progress")]
    InProgress(String),

    #[error("Invalid snapshot state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(Arc::new(e))
    }
}

// === 统一错误处理机制 ===
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Fatal,       // the owning component can not continue
    Recoverable, // the caller may retry or take another path
    Ignorable,   // expected outcome, log only
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;

    /// Logs the error at the level its severity calls for.
    fn report(&self, operation: &str) {
        match self.severity() {
            ErrorSeverity::Fatal => error!("[FATAL] {} failed: {}", operation, self.context()),
            ErrorSeverity::Recoverable => {
                warn!("[RECOVERABLE] {} failed: {}", operation, self.context())
            }
            ErrorSeverity::Ignorable => info!("[IGNORABLE] {} failed: {}", operation, self.context()),
        }
    }
}

impl ErrorHandler for LogStorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            LogStorageError::Io(_) => ErrorSeverity::Fatal,
            LogStorageError::CorruptedBlock { .. } => ErrorSeverity::Fatal,
            LogStorageError::SegmentNotFound(_) => ErrorSeverity::Fatal,
            LogStorageError::OutOfOrder { .. } => ErrorSeverity::Fatal,
            LogStorageError::CommitFailed(_, _) => ErrorSeverity::Fatal,
            LogStorageError::Closed => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for AppendError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            AppendError::Write(_) => ErrorSeverity::Fatal,
            AppendError::Commit { .. } => ErrorSeverity::Fatal,
            AppendError::Unhealthy => ErrorSeverity::Ignorable,
            AppendError::Closed => ErrorSeverity::Ignorable,
            AppendError::InvalidBlock(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        match self {
            AppendError::Write(e) => format!("write: {}", e),
            AppendError::Commit { position, source } => {
                format!("commit up to {}: {}", position, source)
            }
            AppendError::Unhealthy => "appender unhealthy".to_string(),
            AppendError::Closed => "appender closed".to_string(),
            AppendError::InvalidBlock(msg) => format!("invalid block: {}", msg),
        }
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::AlreadyExists(_) => ErrorSeverity::Ignorable,
            SnapshotError::StateClosed => ErrorSeverity::Ignorable,
            SnapshotError::NotFound(_) => ErrorSeverity::Recoverable,
            SnapshotError::Corrupted(_) => ErrorSeverity::Fatal,
            SnapshotError::CopyForBootstrap(_) => ErrorSeverity::Recoverable,
            SnapshotError::InProgress(_) => ErrorSeverity::Recoverable,
            SnapshotError::InvalidState(_) => ErrorSeverity::Recoverable,
            SnapshotError::Io(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_is_cloneable_and_fatal() {
        let err: LogStorageError = std::io::Error::other("disk gone").into();
        let cloned = err.clone();
        assert_eq!(cloned.severity(), ErrorSeverity::Fatal);
        assert!(cloned.context().contains("disk gone"));
    }

    #[test]
    fn test_append_error_severity() {
        let write = AppendError::Write(LogStorageError::Closed);
        assert_eq!(write.severity(), ErrorSeverity::Fatal);
        assert_eq!(AppendError::Unhealthy.severity(), ErrorSeverity::Ignorable);
    }

    #[test]
    fn test_snapshot_error_severity() {
        assert_eq!(
            SnapshotError::AlreadyExists("1-1-1-1-0".into()).severity(),
            ErrorSeverity::Ignorable
        );
        assert_eq!(
            SnapshotError::Corrupted("bad".into()).severity(),
            ErrorSeverity::Fatal
        );
    }
}
