use bincode::{Decode, Encode};
use std::fmt::{self, Display};

use crate::error::LogStorageError;

// 类型定义
pub type Position = u64;
pub type PartitionId = u32;
pub type Payload = Vec<u8>;

/// An entry as it lives in the log: immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoggedEntry {
    pub position: Position,
    pub key: u64,
    /// Position of the entry that caused this one to be written, if any.
    pub source_position: Option<Position>,
    pub payload: Payload,
}

impl LoggedEntry {
    pub fn new(position: Position, key: u64, payload: impl Into<Payload>) -> Self {
        Self {
            position,
            key,
            source_position: None,
            payload: payload.into(),
        }
    }

    pub fn with_source_position(mut self, source_position: Position) -> Self {
        self.source_position = Some(source_position);
        self
    }
}

impl Display for LoggedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoggedEntry[position={}, key={}, source={:?}, {}B]",
            self.position,
            self.key,
            self.source_position,
            self.payload.len()
        )
    }
}

/// Everything the appender can observe about one block it handed to storage.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Durable, not yet committed. Carries the highest position of the block.
    Written(Position),
    Committed(Position),
    WriteError(LogStorageError),
    CommitError(Position, LogStorageError),
}

impl Display for AppendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendOutcome::Written(position) => write!(f, "Written({})", position),
            AppendOutcome::Committed(position) => write!(f, "Committed({})", position),
            AppendOutcome::WriteError(e) => write!(f, "WriteError({})", e),
            AppendOutcome::CommitError(position, e) => {
                write!(f, "CommitError({}, {})", position, e)
            }
        }
    }
}
