//! Stream trigger lifecycle
//!
//! A [`Trigger`] owns one consumer group membership and keeps it alive: it joins the
//! group, runs generations through a [`ConsumptionSession`] until shutdown, and retries
//! with a fixed backoff whenever the group fails. Each generation ends either on a
//! rebalance, after which the loop simply joins again, or on shutdown.
//!
//! Inside a generation every claimed partition gets its own [`PartitionConsumer`], which
//! hands records one at a time to an [`EventSubmitter`] and commits through the
//! [`CommitPolicy`](crate::commit::CommitPolicy). When explicit acks are enabled, an
//! [`ExplicitAckHandler`] per partition applies acks published by the function.

pub mod ack;
pub mod consumer;
pub mod session;
pub mod submitter;

pub use ack::ExplicitAckHandler;
pub use consumer::PartitionConsumer;
pub use session::ConsumptionSession;
pub use submitter::EventSubmitter;

use crate::broker::{ConsumerGroup, ConsumerGroupHandler, GroupSession};
use crate::commit::CommitState;
use crate::config::TriggerConfig;
use crate::error::TriggerError;
use crate::event::{Checkpoint, Offset, PartitionKey};
use crate::metrics::{StatisticsSnapshot, TriggerStatistics};
use crate::worker::WorkerPool;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resume failures tolerated in a row before the trigger gives up
const MAX_CONSECUTIVE_RESUME_FAILURES: u32 = 3;

/// Invoked on conditions the process cannot recover from
pub type FatalHook = Arc<dyn Fn(&TriggerError) + Send + Sync>;

/// Log and abort the process
pub fn abort_on_fatal() -> FatalHook {
    Arc::new(|err: &TriggerError| {
        error!("Unrecoverable trigger failure, aborting: {}", err);
        std::process::abort();
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Created,
    Connecting,
    Consuming { generation: i32 },
    Stopping,
    Stopped,
}

/// Marks offsets of one partition on the current session, never moving backwards
pub(crate) struct OffsetMarker {
    key: PartitionKey,
    session: Arc<dyn GroupSession>,
    state: CommitState,
    statistics: Arc<TriggerStatistics>,
}

impl OffsetMarker {
    /// `initial_offset` is where the claim starts, which the group already committed
    pub(crate) fn new(
        key: PartitionKey,
        initial_offset: Offset,
        session: Arc<dyn GroupSession>,
        statistics: Arc<TriggerStatistics>,
    ) -> Self {
        Self {
            key,
            session,
            state: CommitState::starting_at(initial_offset),
            statistics,
        }
    }

    pub(crate) fn mark(&self, offset: Offset) -> Result<bool> {
        if !self.state.advance(offset) {
            debug!(
                "Skipping mark of {} offset {} (already at {:?})",
                self.key,
                offset,
                self.state.current()
            );
            return Ok(false);
        }

        self.session
            .mark_offset(&self.key.stream, self.key.partition, offset)?;
        self.statistics.record_offset_marked();
        Ok(true)
    }
}

pub struct Trigger<G: ConsumerGroup> {
    config: Arc<TriggerConfig>,
    pool: Arc<dyn WorkerPool>,
    group: Arc<G>,
    statistics: Arc<TriggerStatistics>,
    fatal_hook: FatalHook,
    state: Arc<RwLock<TriggerState>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl<G: ConsumerGroup> Trigger<G> {
    pub fn new(config: TriggerConfig, pool: Arc<dyn WorkerPool>, group: G) -> Result<Self> {
        config.validate()?;
        if pool.workers().is_empty() {
            return Err(TriggerError::invalid_config(
                "Worker pool must contain at least one worker",
            ));
        }

        Ok(Self {
            config: Arc::new(config),
            pool,
            group: Arc::new(group),
            statistics: Arc::new(TriggerStatistics::default()),
            fatal_hook: abort_on_fatal(),
            state: Arc::new(RwLock::new(TriggerState::Created)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    /// Report into a shared collector, such as [`crate::metrics::global_statistics`]
    pub fn with_statistics(mut self, statistics: Arc<TriggerStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn state(&self) -> TriggerState {
        *self.state.read()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn group(&self) -> &Arc<G> {
        &self.group
    }

    /// Configuration as a flat map, for diagnostics
    pub fn get_config(&self) -> Result<Map<String, Value>> {
        self.config.to_map()
    }

    /// Start consuming in the background. Offsets come from the group, so the
    /// checkpoint is only logged.
    pub fn start(&self, checkpoint: Option<Checkpoint>) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() || self.state() != TriggerState::Created {
            return Err(TriggerError::consumer_group(format!(
                "Trigger {} already started",
                self.config.id
            )));
        }

        info!(
            "Starting trigger {} (group: {}, topics: {:?}, checkpoint: {:?})",
            self.config.id, self.config.consumer_group, self.config.topics, checkpoint
        );

        let handler: Arc<dyn ConsumerGroupHandler> = Arc::new(ConsumptionSession::with_state(
            self.config.clone(),
            self.pool.clone(),
            self.statistics.clone(),
            self.fatal_hook.clone(),
            self.state.clone(),
        ));

        let consume_loop = ConsumeLoop {
            config: self.config.clone(),
            pool: self.pool.clone(),
            group: self.group.clone(),
            handler,
            statistics: self.statistics.clone(),
            fatal_hook: self.fatal_hook.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        };

        *self.state.write() = TriggerState::Connecting;
        *task = Some(tokio::spawn(consume_loop.run()));
        Ok(())
    }

    /// Leave the group and wait for the consume loop to exit. With `force` the loop
    /// is aborted instead of awaited.
    pub async fn stop(&self, force: bool) -> Result<Option<Checkpoint>> {
        info!("Stopping trigger {} (force: {})", self.config.id, force);

        *self.state.write() = TriggerState::Stopping;
        self.shutdown.cancel();

        let closed = self.group.close().await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if force {
                task.abort();
            } else {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Consume loop of trigger {} failed: {}", self.config.id, e),
                    Err(e) => warn!("Consume loop of trigger {} panicked: {}", self.config.id, e),
                }
            }
        }

        *self.state.write() = TriggerState::Stopped;

        closed.map_err(|e| TriggerError::consumer_group(format!("Failed to close consumer: {}", e)))?;
        Ok(None)
    }
}

/// Background join/consume/retry loop of one trigger
struct ConsumeLoop<G: ConsumerGroup> {
    config: Arc<TriggerConfig>,
    pool: Arc<dyn WorkerPool>,
    group: Arc<G>,
    handler: Arc<dyn ConsumerGroupHandler>,
    statistics: Arc<TriggerStatistics>,
    fatal_hook: FatalHook,
    state: Arc<RwLock<TriggerState>>,
    shutdown: CancellationToken,
}

impl<G: ConsumerGroup> ConsumeLoop<G> {
    async fn run(self) -> Result<()> {
        let result = self.consume_until_shutdown().await;

        *self.state.write() = TriggerState::Stopped;
        debug!("Consume loop of trigger {} exited", self.config.id);

        result
    }

    async fn consume_until_shutdown(&self) -> Result<()> {
        let mut resume_failures = 0;

        while !self.shutdown.is_cancelled() {
            // workers were told to drain when the previous generation ended
            if let Err(e) = self.pool.signal_continue().await {
                resume_failures += 1;
                self.statistics.record_resume_failure();

                if resume_failures > MAX_CONSECUTIVE_RESUME_FAILURES {
                    let err = TriggerError::fatal(format!(
                        "Failed to resume workers {} times in a row: {}",
                        resume_failures, e
                    ));
                    (self.fatal_hook)(&err);
                    return Err(err);
                }

                warn!(
                    "Failed to signal workers to continue (attempt {}): {}",
                    resume_failures, e
                );
                if !self.backoff().await {
                    break;
                }
                continue;
            }
            resume_failures = 0;

            *self.state.write() = TriggerState::Connecting;
            debug!(
                "Trigger {} joining group {}",
                self.config.id, self.config.consumer_group
            );

            // returns without error when the generation ends on a rebalance
            match self.group.consume(&self.config, self.handler.clone()).await {
                Ok(()) => debug!("Consumer session of trigger {} ended", self.config.id),
                Err(_) if self.shutdown.is_cancelled() => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.statistics.record_connection_failure();
                    warn!(
                        "Failed to consume from group, waiting {:?} before retrying: {}",
                        self.config.retry_backoff(),
                        e
                    );
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Sleep for the retry backoff; false when shutdown arrived first
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff()) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}
