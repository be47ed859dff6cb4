//! Appender draining framed blocks into a [`LogStorage`].
//!
//! One task owns the write path of a partition. Blocks arrive either from the [`LogBlockQueue`]
//! filled by producers or through [`LogStorageAppender::append`]. Storage completions are awaited
//! by a second task, strictly in append order, and handed back to the appender task, which is the
//! only place health and positions are updated.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{AppendError, ErrorHandler, LogStorageError};
use crate::traits::{LogStorage, PendingAppend};
use crate::types::{AppendOutcome, Position};

use super::frame::LogBlock;
use super::health::{HealthReport, HealthTracker};

const COMPONENT: &str = "LogStorageAppender";

/// Producer side of the block queue.
pub type LogBlockWriter = mpsc::Sender<LogBlock>;

/// Consumer side of the block queue, drained by the appender.
pub type LogBlockQueue = mpsc::Receiver<LogBlock>;

/// Creates a bounded block queue. Producers wait when it is full.
pub fn log_block_queue(capacity: usize) -> (LogBlockWriter, LogBlockQueue) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone)]
pub struct AppenderOptions {
    /// Blocks handed to storage but not yet committed before the queue stops being drained.
    pub max_in_flight_blocks: usize,
    /// Capacity of the outcome broadcast channel; slow subscribers observe lag.
    pub outcome_channel_capacity: usize,
}

impl Default for AppenderOptions {
    fn default() -> Self {
        Self {
            max_in_flight_blocks: 1024,
            outcome_channel_capacity: 1024,
        }
    }
}

type AppendReply = oneshot::Sender<Result<Position, AppendError>>;

enum AppenderRequest {
    Append {
        block: LogBlock,
        reply: AppendReply,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A block handed to storage, waiting for its completions.
struct InFlight {
    pending: PendingAppend,
    reply: Option<AppendReply>,
}

/// A storage completion forwarded back to the appender task.
struct Completion {
    outcome: AppendOutcome,
    /// Present on the final outcome of a block appended through [`LogStorageAppender::append`].
    reply: Option<AppendReply>,
}

/// Handle to a running appender.
#[derive(Clone)]
pub struct LogStorageAppender {
    sender: mpsc::UnboundedSender<AppenderRequest>,
    health: watch::Receiver<HealthReport>,
    written: watch::Receiver<Option<Position>>,
    committed: watch::Receiver<Option<Position>>,
    outcomes: broadcast::Sender<AppendOutcome>,
}

impl LogStorageAppender {
    /// Starts the appender tasks. Must be called inside a tokio runtime.
    pub fn start(
        storage: Arc<dyn LogStorage>,
        block_source: LogBlockQueue,
        options: AppenderOptions,
    ) -> Self {
        let (sender, requests) = mpsc::unbounded_channel();
        let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (written_tx, written) = watch::channel(None);
        let (committed_tx, committed) = watch::channel(None);
        let (outcomes, _) = broadcast::channel(options.outcome_channel_capacity.max(1));

        let health = HealthTracker::new(COMPONENT);
        let health_rx = health.subscribe();

        tokio::spawn(forward_completions(in_flight_rx, completion_tx));

        let task = AppenderTask {
            storage,
            options,
            requests,
            block_source,
            source_open: true,
            completions,
            in_flight_tx,
            in_flight: 0,
            health,
            written_tx,
            committed_tx,
            outcomes: outcomes.clone(),
        };
        tokio::spawn(task.run());

        Self {
            sender,
            health: health_rx,
            written,
            committed,
            outcomes,
        }
    }

    /// Appends a block and resolves once it is committed or has failed.
    pub async fn append(&self, block: LogBlock) -> Result<Position, AppendError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AppenderRequest::Append { block, reply: tx })
            .map_err(|_| {
                warn!("Failed to send append request: appender closed");
                AppendError::Closed
            })?;

        rx.await.map_err(|_| AppendError::Closed)?
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.borrow().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.borrow().is_healthy()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthReport> {
        self.health.clone()
    }

    /// Highest position known to be durable.
    pub fn written_position(&self) -> watch::Receiver<Option<Position>> {
        self.written.clone()
    }

    /// Highest position known to be committed.
    pub fn committed_position(&self) -> watch::Receiver<Option<Position>> {
        self.committed.clone()
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<AppendOutcome> {
        self.outcomes.subscribe()
    }

    /// Stops the appender. Appends still waiting for storage resolve with [`AppendError::Closed`].
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(AppenderRequest::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct AppenderTask {
    storage: Arc<dyn LogStorage>,
    options: AppenderOptions,
    requests: mpsc::UnboundedReceiver<AppenderRequest>,
    block_source: LogBlockQueue,
    source_open: bool,
    completions: mpsc::UnboundedReceiver<Completion>,
    in_flight_tx: mpsc::UnboundedSender<InFlight>,
    in_flight: usize,
    health: HealthTracker,
    written_tx: watch::Sender<Option<Position>>,
    committed_tx: watch::Sender<Option<Position>>,
    outcomes: broadcast::Sender<AppendOutcome>,
}

impl AppenderTask {
    async fn run(mut self) {
        info!("Appender started");
        let mut close_reply = None;

        loop {
            let drain_source = self.source_open
                && self.health.is_healthy()
                && self.in_flight < self.options.max_in_flight_blocks;

            tokio::select! {
                biased;

                completion = self.completions.recv() => match completion {
                    Some(completion) => self.on_completion(completion),
                    None => break,
                },

                request = self.requests.recv() => match request {
                    Some(AppenderRequest::Append { block, reply }) => self.on_append(block, Some(reply)),
                    Some(AppenderRequest::Close { reply }) => {
                        close_reply = Some(reply);
                        break;
                    }
                    None => break,
                },

                block = self.block_source.recv(), if drain_source => match block {
                    Some(block) => self.on_append(block, None),
                    None => {
                        debug!("Log block queue closed");
                        self.source_open = false;
                    }
                },
            }
        }

        info!(
            "Appender stopped: in_flight={}, health={}",
            self.in_flight,
            self.health.subscribe().borrow().clone()
        );
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
    }

    fn on_append(&mut self, block: LogBlock, reply: Option<AppendReply>) {
        if !self.health.is_healthy() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(AppendError::Unhealthy));
            }
            return;
        }

        let (lowest, highest, data) = block.into_parts();
        let pending = self.storage.append(lowest, highest, data);
        self.in_flight += 1;

        if let Err(e) = self.in_flight_tx.send(InFlight { pending, reply }) {
            // the completion task only stops when this task drops its sender
            warn!("Completion task gone, dropping block [{}, {}]", lowest, highest);
            self.in_flight -= 1;
            if let Some(reply) = e.0.reply {
                let _ = reply.send(Err(AppendError::Closed));
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion { outcome, reply } = completion;

        let result = match &outcome {
            AppendOutcome::Written(position) => {
                self.written_tx.send_replace(Some(*position));
                None
            }
            AppendOutcome::Committed(position) => {
                self.committed_tx.send_replace(Some(*position));
                Some(Ok(*position))
            }
            AppendOutcome::WriteError(e) => {
                let error = AppendError::Write(e.clone());
                error.report("Append block");
                self.health.mark_unhealthy(error.to_string());
                Some(Err(error))
            }
            AppendOutcome::CommitError(position, e) => {
                let error = AppendError::Commit {
                    position: *position,
                    source: e.clone(),
                };
                error.report("Append block");
                self.health.mark_unhealthy(error.to_string());
                Some(Err(error))
            }
        };

        if let Some(result) = result {
            self.in_flight = self.in_flight.saturating_sub(1);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        // no subscribers is fine
        let _ = self.outcomes.send(outcome);
    }
}

/// Awaits storage completions block by block, so outcomes reach the appender in append order.
async fn forward_completions(
    mut in_flight: mpsc::UnboundedReceiver<InFlight>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(InFlight { pending, reply }) = in_flight.recv().await {
        let highest = pending.highest_position;

        let written = pending
            .written
            .await
            .unwrap_or(Err(LogStorageError::Closed));
        if let Err(e) = written {
            let _ = completions.send(Completion {
                outcome: AppendOutcome::WriteError(e),
                reply,
            });
            continue;
        }
        let _ = completions.send(Completion {
            outcome: AppendOutcome::Written(highest),
            reply: None,
        });

        let outcome = match pending.committed.await.unwrap_or(Err(LogStorageError::Closed)) {
            Ok(()) => AppendOutcome::Committed(highest),
            Err(e) => AppendOutcome::CommitError(highest, e),
        };
        let _ = completions.send(Completion { outcome, reply });
    }
    debug!("Append completion forwarder stopped");
}
