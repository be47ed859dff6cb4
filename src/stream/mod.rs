//! The partition log stream: block framing, the appender and the reader.

mod appender;
mod frame;
mod health;
mod reader;

pub use appender::{
    AppenderOptions, LogBlockQueue, LogBlockWriter, LogStorageAppender, log_block_queue,
};
pub use frame::{
    FRAME_HEADER_SIZE, FRAME_MAGIC_NUM, FrameHeader, FrameIter, LogBlock, LogBlockBuilder,
    decode_frame, encode_frame,
};
pub use health::{HealthReport, HealthStatus};
pub use reader::{
    DEFAULT_INITIAL_CAPACITY, LogStreamReader, LogStreamReaderOptions, MAX_BUFFER_CAPACITY,
};
