//! File-based snapshot store.
//!
//! A single task owns the store directory and all in-memory state; every public operation is a
//! message answered through a oneshot channel. File I/O runs on the blocking pool while the
//! task waits for it, so no two operations of the same store ever interleave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ErrorHandler, SnapshotError};
use crate::traits::SnapshotResult;
use crate::types::{PartitionId, Position};

use super::checksum::ChecksumSet;
use super::id::{
    CHECKSUM_FILE_NAME, METADATA_FILE_NAME, RESERVED_FILE_NAMES, SnapshotId, SnapshotMetadata,
    now_millis,
};
use super::persisted::PersistedSnapshot;
use super::received::ReceivedSnapshot;
use super::reservation::ReservationReason;
use super::transient::TransientSnapshot;

const SNAPSHOTS_DIR: &str = "snapshots";
const PENDING_DIR: &str = "pending";
const BOOTSTRAP_DIR: &str = "bootstrap-snapshots";
const TMP_SUFFIX: &str = ".tmp";
const RECEIVED_SUFFIX: &str = "-received";

/// Snapshot store configuration options.
#[derive(Debug, Clone)]
pub struct SnapshotStoreOptions {
    /// Root directory of this store; nothing outside of it is touched.
    pub root_dir: PathBuf,
    pub partition_id: PartitionId,
    /// Whether to recompute and verify checksums of every snapshot found on open.
    pub verify_checksum_on_load: bool,
    /// Whether to sync data to disk before a snapshot is published.
    pub sync_on_write: bool,
    /// Lease of a reservation taken without an explicit deadline.
    pub default_reservation_lease: Duration,
}

impl Default for SnapshotStoreOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/partition-1"),
            partition_id: 1,
            verify_checksum_on_load: true,
            sync_on_write: true,
            default_reservation_lease: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SnapshotStoreOptions {
    pub fn with_root_dir<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root_dir.join(SNAPSHOTS_DIR)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root_dir.join(PENDING_DIR)
    }

    pub fn bootstrap_dir(&self) -> PathBuf {
        self.root_dir.join(BOOTSTRAP_DIR)
    }

    fn transient_path(&self, id: &SnapshotId) -> PathBuf {
        self.pending_dir().join(id.to_string())
    }

    fn received_path(&self, id: &SnapshotId) -> PathBuf {
        self.pending_dir().join(format!("{}{}", id, RECEIVED_SUFFIX))
    }
}

pub(crate) type Reply<T> = oneshot::Sender<SnapshotResult<T>>;

/// Copies the files of the source snapshot directory into the target directory.
pub(crate) type CopyFn = Box<dyn FnOnce(&Path, &Path) -> anyhow::Result<()> + Send>;

pub(crate) enum StoreRequest {
    NewTransient {
        index: u64,
        term: u64,
        processed_position: Position,
        exported_position: Position,
        force: bool,
        reply: Reply<(SnapshotId, PathBuf)>,
    },
    PersistTransient {
        id: SnapshotId,
        checksums: ChecksumSet,
        metadata: SnapshotMetadata,
        reply: Reply<PersistedSnapshot>,
    },
    AbortTransient {
        id: SnapshotId,
        reply: Option<Reply<()>>,
    },
    NewReceived {
        id: SnapshotId,
        reply: Reply<PathBuf>,
    },
    PersistReceived {
        id: SnapshotId,
        checksums: ChecksumSet,
        expected_checksum: u64,
        reply: Reply<PersistedSnapshot>,
    },
    AbortReceived {
        id: SnapshotId,
        reply: Option<Reply<()>>,
    },
    Available {
        reply: Reply<Vec<PersistedSnapshot>>,
    },
    CompactionBound {
        reply: Reply<Option<Position>>,
    },
    Reserve {
        id: SnapshotId,
        reason: ReservationReason,
        valid_until: Option<SystemTime>,
        reply: Reply<(u64, SystemTime)>,
    },
    Release {
        id: SnapshotId,
        reservation_id: u64,
        reply: Reply<()>,
    },
    IsReserved {
        id: SnapshotId,
        reply: Reply<bool>,
    },
    CopyForBootstrap {
        snapshot: PersistedSnapshot,
        copy: CopyFn,
        reply: Reply<PersistedSnapshot>,
    },
    BootstrapSnapshot {
        reply: Reply<Option<PersistedSnapshot>>,
    },
    DeleteBootstrap {
        reply: Reply<()>,
    },
    AbortPending {
        reply: Reply<()>,
    },
    Delete {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Weak handle held by snapshots and reservations, so they never keep a dropped store alive.
#[derive(Clone)]
pub(crate) struct StoreHandle {
    sender: mpsc::WeakUnboundedSender<StoreRequest>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl StoreHandle {
    pub(crate) fn new(sender: &mpsc::UnboundedSender<StoreRequest>) -> Self {
        Self {
            sender: sender.downgrade(),
        }
    }

    pub(crate) async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> StoreRequest,
    ) -> SnapshotResult<T> {
        let sender = self.sender.upgrade().ok_or(SnapshotError::StateClosed)?;
        let (tx, rx) = oneshot::channel();
        sender.send(request(tx)).map_err(|_| {
            warn!("Failed to send snapshot store request: store closed");
            SnapshotError::StateClosed
        })?;

        rx.await.map_err(|_| SnapshotError::StateClosed)?
    }

    /// Sends a request nobody waits for.
    pub(crate) fn notify(&self, request: StoreRequest) {
        if let Some(sender) = self.sender.upgrade() {
            let _ = sender.send(request);
        }
    }
}

/// Runs blocking file work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> SnapshotResult<T>
where
    F: FnOnce() -> SnapshotResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        SnapshotError::Io(Arc::new(std::io::Error::other(format!(
            "Snapshot task failed: {}",
            e
        ))))
    })?
}

/// Writes the metadata and checksum files into a snapshot directory.
fn write_snapshot_files(
    dir: &Path,
    metadata: &SnapshotMetadata,
    checksums: &ChecksumSet,
    sync: bool,
) -> SnapshotResult<()> {
    let metadata_path = dir.join(METADATA_FILE_NAME);
    metadata.write_to(&metadata_path)?;
    checksums.write_sfv_file(&dir.join(CHECKSUM_FILE_NAME), sync)?;

    if sync {
        File::open(&metadata_path)?.sync_all()?;
        for name in checksums.names() {
            File::open(dir.join(name))?.sync_all()?;
        }
    }
    Ok(())
}

/// Makes a fully written directory visible under its final name in one step.
fn publish(from: &Path, to: &Path, sync: bool) -> SnapshotResult<()> {
    fs::rename(from, to)?;
    if sync {
        if let Some(parent) = to.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes every entry of `dir` by name, without looking into snapshot contents.
fn clear_dir(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Loads and verifies one published snapshot directory.
fn load_snapshot(
    dir: &Path,
    id: SnapshotId,
    verify: bool,
    handle: &StoreHandle,
) -> SnapshotResult<PersistedSnapshot> {
    let metadata = SnapshotMetadata::read_from(&dir.join(METADATA_FILE_NAME))?;
    let recorded = ChecksumSet::read_sfv_file(&dir.join(CHECKSUM_FILE_NAME))?;
    if recorded.is_empty() {
        return Err(SnapshotError::Corrupted(format!(
            "snapshot {} has no files",
            id
        )));
    }

    if verify {
        let actual = ChecksumSet::from_directory(dir, &RESERVED_FILE_NAMES)?;
        if !actual.same_checksums(&recorded) {
            return Err(SnapshotError::Corrupted(format!(
                "checksums of snapshot {} do not match its files",
                id
            )));
        }
    }

    Ok(PersistedSnapshot::new(
        id,
        dir.to_path_buf(),
        metadata,
        recorded,
        handle.clone(),
    ))
}

/// Loads the valid snapshots of `dir`, deleting corrupt and partial ones.
fn load_snapshot_dir(
    dir: &Path,
    verify: bool,
    handle: &StoreHandle,
) -> SnapshotResult<Vec<PersistedSnapshot>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if !entry.file_type()?.is_dir() {
            warn!("Ignoring unexpected file in snapshot directory: {:?}", path);
            continue;
        }

        let loaded = name
            .parse::<SnapshotId>()
            .and_then(|id| load_snapshot(&path, id, verify, handle));
        match loaded {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                warn!("Deleting invalid snapshot {:?}: {}", path, e);
                remove_dir_if_exists(&path)?;
            }
        }
    }

    snapshots.sort_by_key(|s| *s.id());
    Ok(snapshots)
}

/// Keeps the newest of `snapshots` and deletes the others from disk.
fn keep_newest(mut snapshots: Vec<PersistedSnapshot>) -> SnapshotResult<Option<PersistedSnapshot>> {
    let newest = snapshots.pop();
    for older in snapshots {
        info!("Deleting older snapshot on open: id={}", older.id());
        remove_dir_if_exists(older.path())?;
    }
    Ok(newest)
}

struct Lease {
    reason: ReservationReason,
    valid_until: SystemTime,
}

struct SnapshotEntry {
    snapshot: PersistedSnapshot,
    reservations: HashMap<u64, Lease>,
}

impl SnapshotEntry {
    fn new(snapshot: PersistedSnapshot) -> Self {
        Self {
            snapshot,
            reservations: HashMap::new(),
        }
    }

    fn is_reserved(&self, now: SystemTime) -> bool {
        self.reservations.values().any(|lease| lease.valid_until > now)
    }
}

/// Handle to a running file-based snapshot store.
#[derive(Clone)]
pub struct FileBasedSnapshotStore {
    options: Arc<SnapshotStoreOptions>,
    sender: mpsc::UnboundedSender<StoreRequest>,
    latest: watch::Receiver<Option<PersistedSnapshot>>,
}

impl FileBasedSnapshotStore {
    /// Loads the store from `options.root_dir` and starts its task. Must be called inside a
    /// tokio runtime.
    pub fn open(options: SnapshotStoreOptions) -> SnapshotResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = StoreHandle::new(&sender);

        let snapshots_dir = options.snapshots_dir();
        let pending_dir = options.pending_dir();
        let bootstrap_dir = options.bootstrap_dir();
        fs::create_dir_all(&snapshots_dir)?;
        fs::create_dir_all(&bootstrap_dir)?;

        // pending snapshots never survive a restart
        remove_dir_if_exists(&pending_dir)?;
        fs::create_dir_all(&pending_dir)?;

        let verify = options.verify_checksum_on_load;
        let latest = keep_newest(load_snapshot_dir(&snapshots_dir, verify, &handle)?)?;

        for entry in fs::read_dir(&bootstrap_dir)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!("Deleting partial bootstrap snapshot {:?}", path);
                remove_dir_if_exists(&path)?;
            }
        }
        let bootstrap = keep_newest(load_snapshot_dir(&bootstrap_dir, verify, &handle)?)?;

        info!(
            "Opened snapshot store: partition={}, root={:?}, latest={:?}",
            options.partition_id,
            options.root_dir,
            latest.as_ref().map(|s| s.id().to_string())
        );

        let (latest_tx, latest_rx) = watch::channel(latest.clone());
        let mut snapshots = BTreeMap::new();
        if let Some(snapshot) = latest {
            snapshots.insert(*snapshot.id(), SnapshotEntry::new(snapshot));
        }

        let options = Arc::new(options);
        let actor = SnapshotStoreActor {
            options: options.clone(),
            handle,
            snapshots,
            transient: None,
            received: HashSet::new(),
            bootstrap,
            latest_tx,
        };
        tokio::spawn(actor.run(receiver));

        Ok(Self {
            options,
            sender,
            latest: latest_rx,
        })
    }

    fn handle(&self) -> StoreHandle {
        StoreHandle::new(&self.sender)
    }

    pub fn options(&self) -> &SnapshotStoreOptions {
        &self.options
    }

    pub fn partition_id(&self) -> PartitionId {
        self.options.partition_id
    }

    /// Starts a new snapshot at the given consensus and log positions.
    ///
    /// Fails with [`SnapshotError::AlreadyExists`] if the latest snapshot is at the same or
    /// greater positions, unless `force` is set, in which case only strictly greater positions
    /// fail. Fails with [`SnapshotError::InProgress`] while another transient snapshot is pending.
    pub async fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: Position,
        exported_position: Position,
        force: bool,
    ) -> SnapshotResult<TransientSnapshot> {
        let handle = self.handle();
        let (id, path) = handle
            .call(|reply| StoreRequest::NewTransient {
                index,
                term,
                processed_position,
                exported_position,
                force,
                reply,
            })
            .await?;
        Ok(TransientSnapshot::new(id, path, handle))
    }

    /// Opens a write target for a snapshot replicated in chunks.
    pub async fn new_received_snapshot(&self, snapshot_id: &str) -> SnapshotResult<ReceivedSnapshot> {
        let id = snapshot_id.parse::<SnapshotId>()?;
        let handle = self.handle();
        let path = handle
            .call(|reply| StoreRequest::NewReceived { id, reply })
            .await?;
        Ok(ReceivedSnapshot::new(id, path, handle))
    }

    /// The newest fully published snapshot.
    pub fn latest_snapshot(&self) -> Option<PersistedSnapshot> {
        self.latest.borrow().clone()
    }

    /// Notified whenever a new snapshot becomes the latest.
    pub fn subscribe_latest(&self) -> watch::Receiver<Option<PersistedSnapshot>> {
        self.latest.clone()
    }

    /// Snapshots currently on disk, oldest first.
    pub async fn available_snapshots(&self) -> SnapshotResult<Vec<PersistedSnapshot>> {
        self.handle()
            .call(|reply| StoreRequest::Available { reply })
            .await
    }

    /// Lowest log position still needed by the latest or any reserved snapshot, `None` without
    /// snapshots. Log segments entirely below it may be deleted.
    pub async fn compaction_bound(&self) -> SnapshotResult<Option<Position>> {
        self.handle()
            .call(|reply| StoreRequest::CompactionBound { reply })
            .await
    }

    pub async fn is_reserved(&self, id: &SnapshotId) -> SnapshotResult<bool> {
        let id = *id;
        self.handle()
            .call(|reply| StoreRequest::IsReserved { id, reply })
            .await
    }

    /// Copies `snapshot` through `copy` into a bootstrap snapshot with index and term 0.
    pub async fn copy_for_bootstrap<F>(
        &self,
        snapshot: &PersistedSnapshot,
        copy: F,
    ) -> SnapshotResult<PersistedSnapshot>
    where
        F: FnOnce(&Path, &Path) -> anyhow::Result<()> + Send + 'static,
    {
        let snapshot = snapshot.clone();
        self.handle()
            .call(|reply| StoreRequest::CopyForBootstrap {
                snapshot,
                copy: Box::new(copy),
                reply,
            })
            .await
    }

    pub async fn bootstrap_snapshot(&self) -> SnapshotResult<Option<PersistedSnapshot>> {
        self.handle()
            .call(|reply| StoreRequest::BootstrapSnapshot { reply })
            .await
    }

    pub async fn delete_bootstrap_snapshots(&self) -> SnapshotResult<()> {
        self.handle()
            .call(|reply| StoreRequest::DeleteBootstrap { reply })
            .await
    }

    /// Discards every transient and received snapshot in progress.
    pub async fn abort_pending_snapshots(&self) -> SnapshotResult<()> {
        self.handle()
            .call(|reply| StoreRequest::AbortPending { reply })
            .await
    }

    /// Removes all snapshots of this store from disk.
    pub async fn delete(&self) -> SnapshotResult<()> {
        self.handle()
            .call(|reply| StoreRequest::Delete { reply })
            .await
    }

    /// Stops the store task. Later calls fail with [`SnapshotError::StateClosed`].
    pub async fn close(&self) -> SnapshotResult<()> {
        self.handle()
            .call(|reply| StoreRequest::Close { reply })
            .await
    }
}

struct SnapshotStoreActor {
    options: Arc<SnapshotStoreOptions>,
    handle: StoreHandle,
    snapshots: BTreeMap<SnapshotId, SnapshotEntry>,
    /// The single transient snapshot in progress.
    transient: Option<SnapshotId>,
    received: HashSet<SnapshotId>,
    bootstrap: Option<PersistedSnapshot>,
    latest_tx: watch::Sender<Option<PersistedSnapshot>>,
}

fn respond<T>(reply: Reply<T>, result: SnapshotResult<T>, operation: &str) {
    if let Err(e) = &result {
        e.report(operation);
    }
    let _ = reply.send(result);
}

impl SnapshotStoreActor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<StoreRequest>) {
        while let Some(request) = receiver.recv().await {
            match request {
                StoreRequest::NewTransient {
                    index,
                    term,
                    processed_position,
                    exported_position,
                    force,
                    reply,
                } => {
                    let result = self.new_transient(
                        index,
                        term,
                        processed_position,
                        exported_position,
                        force,
                    );
                    respond(reply, result, "Create transient snapshot");
                }
                StoreRequest::PersistTransient {
                    id,
                    checksums,
                    metadata,
                    reply,
                } => {
                    let result = self.persist_transient(id, checksums, metadata).await;
                    respond(reply, result, "Persist snapshot");
                }
                StoreRequest::AbortTransient { id, reply } => {
                    let result = self.abort_transient(id).await;
                    if let Some(reply) = reply {
                        respond(reply, result, "Abort snapshot");
                    }
                }
                StoreRequest::NewReceived { id, reply } => {
                    let result = self.new_received(id);
                    respond(reply, result, "Create received snapshot");
                }
                StoreRequest::PersistReceived {
                    id,
                    checksums,
                    expected_checksum,
                    reply,
                } => {
                    let result = self
                        .persist_received(id, checksums, expected_checksum)
                        .await;
                    respond(reply, result, "Persist received snapshot");
                }
                StoreRequest::AbortReceived { id, reply } => {
                    let result = self.abort_received(id).await;
                    if let Some(reply) = reply {
                        respond(reply, result, "Abort received snapshot");
                    }
                }
                StoreRequest::Available { reply } => {
                    let snapshots = self
                        .snapshots
                        .values()
                        .map(|entry| entry.snapshot.clone())
                        .collect();
                    let _ = reply.send(Ok(snapshots));
                }
                StoreRequest::CompactionBound { reply } => {
                    let _ = reply.send(Ok(self.compaction_bound()));
                }
                StoreRequest::Reserve {
                    id,
                    reason,
                    valid_until,
                    reply,
                } => {
                    let result = self.reserve(id, reason, valid_until);
                    respond(reply, result, "Reserve snapshot");
                }
                StoreRequest::Release {
                    id,
                    reservation_id,
                    reply,
                } => {
                    self.release(id, reservation_id).await;
                    let _ = reply.send(Ok(()));
                }
                StoreRequest::IsReserved { id, reply } => {
                    let reserved = self
                        .snapshots
                        .get(&id)
                        .is_some_and(|entry| entry.is_reserved(SystemTime::now()));
                    let _ = reply.send(Ok(reserved));
                }
                StoreRequest::CopyForBootstrap {
                    snapshot,
                    copy,
                    reply,
                } => {
                    let result = self.copy_for_bootstrap(snapshot, copy).await;
                    respond(reply, result, "Copy snapshot for bootstrap");
                }
                StoreRequest::BootstrapSnapshot { reply } => {
                    let _ = reply.send(Ok(self.bootstrap.clone()));
                }
                StoreRequest::DeleteBootstrap { reply } => {
                    let result = self.delete_bootstrap().await;
                    respond(reply, result, "Delete bootstrap snapshots");
                }
                StoreRequest::AbortPending { reply } => {
                    let result = self.abort_pending().await;
                    respond(reply, result, "Abort pending snapshots");
                }
                StoreRequest::Delete { reply } => {
                    let result = self.delete().await;
                    respond(reply, result, "Delete snapshot store");
                }
                StoreRequest::Close { reply } => {
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }

        info!(
            "Snapshot store stopped: partition={}",
            self.options.partition_id
        );
    }

    fn latest_id(&self) -> Option<SnapshotId> {
        self.snapshots.keys().next_back().copied()
    }

    fn new_transient(
        &mut self,
        index: u64,
        term: u64,
        processed_position: Position,
        exported_position: Position,
        force: bool,
    ) -> SnapshotResult<(SnapshotId, PathBuf)> {
        if let Some(pending) = self.transient {
            return Err(SnapshotError::InProgress(pending.to_string()));
        }

        let positions = (index, term, processed_position, exported_position);
        let mut timestamp = now_millis();
        if let Some(latest) = self.latest_id() {
            let exists = if force {
                latest.positions() > positions
            } else {
                latest.positions() >= positions
            };
            if exists {
                return Err(SnapshotError::AlreadyExists(latest.to_string()));
            }
            if latest.positions() == positions {
                timestamp = timestamp.max(latest.timestamp + 1);
            }
        }

        let id = SnapshotId::new(index, term, processed_position, exported_position, timestamp);
        let path = self.options.transient_path(&id);
        remove_dir_if_exists(&path)?;
        fs::create_dir_all(&path)?;
        self.transient = Some(id);

        debug!("Created transient snapshot: id={}, path={:?}", id, path);
        Ok((id, path))
    }

    async fn persist_transient(
        &mut self,
        id: SnapshotId,
        checksums: ChecksumSet,
        metadata: SnapshotMetadata,
    ) -> SnapshotResult<PersistedSnapshot> {
        if self.transient != Some(id) {
            return Err(SnapshotError::InvalidState(format!(
                "snapshot {} is not pending",
                id
            )));
        }
        self.ensure_newer_than_latest(&id)?;

        let pending = self.options.transient_path(&id);
        let target = self.options.snapshots_dir().join(id.to_string());
        let sync = self.options.sync_on_write;

        let file_metadata = metadata.clone();
        let checksums = run_blocking(move || {
            let actual = ChecksumSet::from_directory(&pending, &RESERVED_FILE_NAMES)?;
            if actual.is_empty() {
                return Err(SnapshotError::Corrupted(format!(
                    "snapshot {} has no files",
                    id
                )));
            }
            if !actual.same_checksums(&checksums) {
                return Err(SnapshotError::Corrupted(format!(
                    "checksums of snapshot {} do not match the files written",
                    id
                )));
            }

            write_snapshot_files(&pending, &file_metadata, &actual, sync)?;
            publish(&pending, &target, sync)?;
            Ok(actual)
        })
        .await?;

        self.transient = None;
        let snapshot = self.published(id, metadata, checksums);
        self.on_new_snapshot(snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn abort_transient(&mut self, id: SnapshotId) -> SnapshotResult<()> {
        if self.transient != Some(id) {
            return Ok(());
        }

        self.transient = None;
        let path = self.options.transient_path(&id);
        run_blocking(move || Ok(remove_dir_if_exists(&path)?)).await?;
        info!("Aborted transient snapshot: id={}", id);
        Ok(())
    }

    fn new_received(&mut self, id: SnapshotId) -> SnapshotResult<PathBuf> {
        self.ensure_newer_than_latest(&id)?;
        if !self.received.insert(id) {
            return Err(SnapshotError::InProgress(id.to_string()));
        }

        let path = self.options.received_path(&id);
        remove_dir_if_exists(&path)?;
        fs::create_dir_all(&path)?;

        debug!("Receiving snapshot: id={}, path={:?}", id, path);
        Ok(path)
    }

    async fn persist_received(
        &mut self,
        id: SnapshotId,
        checksums: ChecksumSet,
        expected_checksum: u64,
    ) -> SnapshotResult<PersistedSnapshot> {
        if !self.received.contains(&id) {
            return Err(SnapshotError::InvalidState(format!(
                "snapshot {} is not being received",
                id
            )));
        }
        self.ensure_newer_than_latest(&id)?;

        let pending = self.options.received_path(&id);
        let target = self.options.snapshots_dir().join(id.to_string());
        let sync = self.options.sync_on_write;

        let (metadata, checksums) = run_blocking(move || {
            let actual = ChecksumSet::from_directory(&pending, &RESERVED_FILE_NAMES)?;
            if actual.is_empty() {
                return Err(SnapshotError::Corrupted(format!(
                    "received snapshot {} has no files",
                    id
                )));
            }
            if !actual.same_checksums(&checksums) {
                return Err(SnapshotError::Corrupted(format!(
                    "files of received snapshot {} do not match the applied chunks",
                    id
                )));
            }
            if actual.combined_checksum() != expected_checksum {
                return Err(SnapshotError::Corrupted(format!(
                    "received snapshot {} has checksum {:08x}, expected {:08x}",
                    id,
                    actual.combined_checksum(),
                    expected_checksum
                )));
            }

            let metadata_path = pending.join(METADATA_FILE_NAME);
            let metadata = if metadata_path.exists() {
                SnapshotMetadata::read_from(&metadata_path)?
            } else {
                SnapshotMetadata::for_id(&id)
            };

            write_snapshot_files(&pending, &metadata, &actual, sync)?;
            publish(&pending, &target, sync)?;
            Ok((metadata, actual))
        })
        .await?;

        self.received.remove(&id);
        let snapshot = self.published(id, metadata, checksums);
        self.on_new_snapshot(snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn abort_received(&mut self, id: SnapshotId) -> SnapshotResult<()> {
        if !self.received.remove(&id) {
            return Ok(());
        }

        let path = self.options.received_path(&id);
        run_blocking(move || Ok(remove_dir_if_exists(&path)?)).await?;
        info!("Aborted received snapshot: id={}", id);
        Ok(())
    }

    fn ensure_newer_than_latest(&self, id: &SnapshotId) -> SnapshotResult<()> {
        match self.latest_id() {
            Some(latest) if latest >= *id => Err(SnapshotError::AlreadyExists(id.to_string())),
            _ => Ok(()),
        }
    }

    fn published(
        &self,
        id: SnapshotId,
        metadata: SnapshotMetadata,
        checksums: ChecksumSet,
    ) -> PersistedSnapshot {
        let path = self.options.snapshots_dir().join(id.to_string());
        PersistedSnapshot::new(id, path, metadata, checksums, self.handle.clone())
    }

    async fn on_new_snapshot(&mut self, snapshot: PersistedSnapshot) {
        let id = *snapshot.id();
        self.snapshots.insert(id, SnapshotEntry::new(snapshot.clone()));
        self.latest_tx.send_replace(Some(snapshot));

        info!(
            "Persisted new snapshot: partition={}, id={}",
            self.options.partition_id, id
        );
        self.purge().await;
    }

    /// Deletes every snapshot that is neither the latest nor reserved. Expired leases are
    /// dropped on the way.
    async fn purge(&mut self) {
        let now = SystemTime::now();
        let latest = self.latest_id();

        let mut removed = Vec::new();
        self.snapshots.retain(|id, entry| {
            entry.reservations.retain(|_, lease| lease.valid_until > now);
            if Some(*id) == latest || !entry.reservations.is_empty() {
                return true;
            }
            removed.push((*id, entry.snapshot.path().to_path_buf()));
            false
        });

        if removed.is_empty() {
            return;
        }

        let result = run_blocking(move || {
            for (id, path) in removed {
                match remove_dir_if_exists(&path) {
                    Ok(()) => info!("Deleted snapshot: id={}", id),
                    Err(e) => warn!("Failed to delete snapshot {:?}: {}", path, e),
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            e.report("Purge snapshots");
        }
    }

    fn compaction_bound(&self) -> Option<Position> {
        let now = SystemTime::now();
        let latest = self.latest_id()?;

        self.snapshots
            .iter()
            .filter(|(id, entry)| **id == latest || entry.is_reserved(now))
            .map(|(_, entry)| entry.snapshot.compaction_bound())
            .min()
    }

    fn reserve(
        &mut self,
        id: SnapshotId,
        reason: ReservationReason,
        valid_until: Option<SystemTime>,
    ) -> SnapshotResult<(u64, SystemTime)> {
        let lease = self.options.default_reservation_lease;
        let entry = self
            .snapshots
            .get_mut(&id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        if !entry.snapshot.path().is_dir() {
            warn!("Snapshot {} was removed from disk outside of the store", id);
            return Err(SnapshotError::NotFound(id.to_string()));
        }

        let valid_until = valid_until.unwrap_or_else(|| SystemTime::now() + lease);
        let mut reservation_id = rand::random::<u64>();
        while entry.reservations.contains_key(&reservation_id) {
            reservation_id = rand::random::<u64>();
        }
        entry.reservations.insert(
            reservation_id,
            Lease {
                reason,
                valid_until,
            },
        );

        debug!(
            "Reserved snapshot: id={}, reservation={}, reason={:?}",
            id, reservation_id, reason
        );
        Ok((reservation_id, valid_until))
    }

    async fn release(&mut self, id: SnapshotId, reservation_id: u64) {
        let lease = self
            .snapshots
            .get_mut(&id)
            .and_then(|entry| entry.reservations.remove(&reservation_id));
        if let Some(lease) = lease {
            debug!(
                "Released snapshot reservation: id={}, reservation={}, reason={:?}",
                id, reservation_id, lease.reason
            );
            self.purge().await;
        }
    }

    async fn copy_for_bootstrap(
        &mut self,
        snapshot: PersistedSnapshot,
        copy: CopyFn,
    ) -> SnapshotResult<PersistedSnapshot> {
        if let Some(existing) = &self.bootstrap {
            return Err(SnapshotError::CopyForBootstrap(format!(
                "bootstrap snapshot {} already exists",
                existing.id()
            )));
        }

        let source = snapshot.path().to_path_buf();
        if !source.is_dir() {
            return Err(SnapshotError::NotFound(snapshot.id().to_string()));
        }

        let source_id = snapshot.id();
        let id = SnapshotId::new(
            0,
            0,
            source_id.processed_position,
            source_id.exported_position,
            source_id.timestamp,
        );
        let bootstrap_dir = self.options.bootstrap_dir();
        let tmp = bootstrap_dir.join(format!("{}{}", id, TMP_SUFFIX));
        let target = bootstrap_dir.join(id.to_string());
        let metadata = snapshot.metadata().clone();
        let sync = self.options.sync_on_write;

        let file_metadata = metadata.clone();
        let checksums = run_blocking(move || {
            remove_dir_if_exists(&tmp)?;
            fs::create_dir_all(&tmp)?;

            let copied = copy(&source, &tmp).map_err(|e| format!("{:#}", e)).and_then(|_| {
                let checksums = ChecksumSet::from_directory(&tmp, &RESERVED_FILE_NAMES)
                    .map_err(|e| e.to_string())?;
                if checksums.is_empty() {
                    return Err("copy produced no files".to_string());
                }
                Ok(checksums)
            });
            let checksums = match copied {
                Ok(checksums) => checksums,
                Err(reason) => {
                    let _ = remove_dir_if_exists(&tmp);
                    return Err(SnapshotError::CopyForBootstrap(reason));
                }
            };

            write_snapshot_files(&tmp, &file_metadata, &checksums, sync)?;
            publish(&tmp, &target, sync)?;
            Ok(checksums)
        })
        .await?;

        let path = bootstrap_dir.join(id.to_string());
        let bootstrap = PersistedSnapshot::new(id, path, metadata, checksums, self.handle.clone());
        self.bootstrap = Some(bootstrap.clone());

        info!(
            "Copied snapshot for bootstrap: source={}, bootstrap={}",
            source_id, id
        );
        Ok(bootstrap)
    }

    async fn delete_bootstrap(&mut self) -> SnapshotResult<()> {
        self.bootstrap = None;
        let dir = self.options.bootstrap_dir();
        let removed = run_blocking(move || Ok(clear_dir(&dir)?)).await?;
        info!("Deleted bootstrap snapshots: count={}", removed);
        Ok(())
    }

    async fn abort_pending(&mut self) -> SnapshotResult<()> {
        let transient = self.transient.take();
        let received = self.received.len();
        self.received.clear();

        let dir = self.options.pending_dir();
        run_blocking(move || Ok(clear_dir(&dir)?)).await?;
        info!(
            "Aborted pending snapshots: transient={:?}, received={}",
            transient.map(|id| id.to_string()),
            received
        );
        Ok(())
    }

    async fn delete(&mut self) -> SnapshotResult<()> {
        self.snapshots.clear();
        self.transient = None;
        self.received.clear();
        self.bootstrap = None;
        self.latest_tx.send_replace(None);

        let dirs = [
            self.options.snapshots_dir(),
            self.options.pending_dir(),
            self.options.bootstrap_dir(),
        ];
        let removed = run_blocking(move || {
            let mut removed = 0;
            for dir in &dirs {
                removed += clear_dir(dir)?;
            }
            Ok(removed)
        })
        .await?;

        info!(
            "Deleted snapshot store: partition={}, entries={}",
            self.options.partition_id, removed
        );
        Ok(())
    }
}
