pub mod log;
pub mod snapshot;

pub use log::{ListLogStorage, SegmentedLogStorage, SegmentedLogStorageOptions};
pub use snapshot::{FileBasedSnapshotStore, SnapshotStoreOptions};
