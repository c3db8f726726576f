use super::ack::ExplicitAckHandler;
use super::session::Generation;
use super::submitter::{EventSubmitter, Submission};
use super::{FatalHook, OffsetMarker};
use crate::broker::GroupSession;
use crate::commit::{CommitPolicy, Completion};
use crate::config::{self, ExplicitAckMode, TriggerConfig};
use crate::error::TriggerError;
use crate::event::{Event, Offset, PartitionKey, Record};
use crate::metrics::TriggerStatistics;
use crate::partitionworker::AllocationCookie;
use crate::worker::{WorkerHandle, WorkerPool};
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A record that was handed to the submitter and has not completed yet
struct InFlight {
    offset: Offset,
    handle: WorkerHandle,
    cookie: AllocationCookie,
    done: oneshot::Receiver<Completion>,
}

/// How the consume loop ended
enum Exit {
    /// Record stream closed
    Exhausted,
    /// Session cancelled, possibly with a record still in flight
    Rebalance(Option<InFlight>),
}

/// Drives one claimed partition: allocate, submit, wait, commit, release
pub struct PartitionConsumer {
    key: PartitionKey,
    session: Arc<dyn GroupSession>,
    generation: Arc<Generation>,
    pool: Arc<dyn WorkerPool>,
    config: Arc<TriggerConfig>,
    policy: CommitPolicy,
    marker: Arc<OffsetMarker>,
    statistics: Arc<TriggerStatistics>,
    fatal_hook: FatalHook,
}

impl PartitionConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: PartitionKey,
        initial_offset: Offset,
        session: Arc<dyn GroupSession>,
        generation: Arc<Generation>,
        pool: Arc<dyn WorkerPool>,
        config: Arc<TriggerConfig>,
        statistics: Arc<TriggerStatistics>,
        fatal_hook: FatalHook,
    ) -> Self {
        let marker = Arc::new(OffsetMarker::new(
            key.clone(),
            initial_offset,
            session.clone(),
            statistics.clone(),
        ));

        Self {
            policy: CommitPolicy::from_config(&config),
            key,
            session,
            generation,
            pool,
            config,
            marker,
            statistics,
            fatal_hook,
        }
    }

    pub async fn run(self, mut records: mpsc::Receiver<Record>) -> Result<()> {
        let cancellation = self.session.cancellation();

        let (submissions, submission_rx) = mpsc::channel(1);
        let submitter = EventSubmitter::new(self.key.clone(), self.policy, self.statistics.clone());
        let submitter_task = tokio::spawn(submitter.run(submission_rx));

        let ack_handler = (self.policy.mode() != ExplicitAckMode::Disable).then(|| {
            ExplicitAckHandler::start(
                self.key.clone(),
                &self.pool.workers(),
                self.policy,
                self.marker.clone(),
                self.statistics.clone(),
            )
        });

        let result = match self
            .consume(&mut records, &submissions, &cancellation)
            .await
        {
            Ok(Exit::Exhausted) => Ok(()),
            Ok(Exit::Rebalance(in_flight)) => self.drain(in_flight).await,
            Err(e) => Err(e),
        };

        debug!("Claim consumption stopped for {}", self.key);

        drop(submissions);
        self.stop_submitter(submitter_task, &result).await;

        if let Some(ack_handler) = ack_handler {
            ack_handler.stop().await;
        }

        result
    }

    async fn consume(
        &self,
        records: &mut mpsc::Receiver<Record>,
        submissions: &mpsc::Sender<Submission>,
        cancellation: &CancellationToken,
    ) -> Result<Exit> {
        loop {
            let record = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Ok(Exit::Rebalance(None)),
                record = records.recv() => match record {
                    Some(record) => record,
                    None => return Ok(Exit::Exhausted),
                },
            };

            let Some((handle, cookie)) = self.allocate(cancellation).await? else {
                return Ok(Exit::Rebalance(None));
            };

            let offset = record.offset;
            let (done_tx, done) = oneshot::channel();
            let submission = Submission {
                event: Event::new(record, &self.config.kind, &self.config.name),
                worker: handle.shared(),
                done: done_tx,
            };

            if submissions.send(submission).await.is_err() {
                self.generation.allocator.release(cookie, handle)?;
                return Err(TriggerError::worker(format!(
                    "Event submitter for {} stopped",
                    self.key
                )));
            }

            let mut in_flight = InFlight {
                offset,
                handle,
                cookie,
                done,
            };

            let completion = tokio::select! {
                completion = &mut in_flight.done => Some(completion),
                _ = cancellation.cancelled() => None,
            };

            match completion {
                Some(completion) => self.complete(in_flight, completion)?,
                None => return Ok(Exit::Rebalance(Some(in_flight))),
            }
        }
    }

    /// Wait for a worker, retrying bounded waits; `None` once the session is cancelled
    async fn allocate(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Option<(WorkerHandle, AllocationCookie)>> {
        let timeout = self.config.allocation_timeout();

        loop {
            let allocated = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Ok(None),
                allocated = self.generation.allocator.allocate(&self.key.stream, self.key.partition, timeout) => allocated,
            };

            match allocated {
                Ok(allocated) => return Ok(Some(allocated)),
                Err(e) if e.is_no_available_workers() => {
                    self.statistics.record_allocation_timeout();
                    warn!(
                        "No worker available for {} within {:?}, retrying",
                        self.key, timeout
                    );
                }
                Err(e) => {
                    return Err(TriggerError::worker(format!(
                        "Failed to allocate worker for {}: {}",
                        self.key, e
                    )))
                }
            }
        }
    }

    /// Commit per policy and give the worker back
    fn complete(
        &self,
        in_flight: InFlight,
        completion: std::result::Result<Completion, oneshot::error::RecvError>,
    ) -> Result<()> {
        let marked = match completion {
            Ok(completion) => match self.policy.offset_to_mark(in_flight.offset, &completion) {
                Some(mark) => self.marker.mark(mark).map(|_| ()),
                None => Ok(()),
            },
            Err(_) => {
                warn!(
                    "Submitter for {} dropped offset {} without a result",
                    self.key, in_flight.offset
                );
                Ok(())
            }
        };

        self.generation
            .allocator
            .release(in_flight.cookie, in_flight.handle)?;
        marked
    }

    async fn drain(&self, in_flight: Option<InFlight>) -> Result<()> {
        info!("Rebalance signaled, draining {}", self.key);

        if let Some(in_flight) = in_flight {
            self.drain_in_flight(in_flight).await?;
        }

        if self.generation.begin_drain() {
            match self.pool.signal_drain().await {
                Ok(()) => info!("Signaled workers to drain (generation: {})", self.generation.id),
                Err(e) => warn!("Failed to signal workers to drain: {}", e),
            }
        }

        if self.policy.mode() != ExplicitAckMode::Disable {
            let wait = self.config.wait_explicit_ack_during_rebalance_timeout();
            debug!("Waiting {:?} for explicit acks on {}", wait, self.key);
            tokio::time::sleep(wait).await;
        }

        Ok(())
    }

    async fn drain_in_flight(&self, mut in_flight: InFlight) -> Result<()> {
        let timeout = self.config.max_wait_handler_during_rebalance();

        match tokio::time::timeout(timeout, &mut in_flight.done).await {
            Ok(completion) => {
                debug!(
                    "Handler for {} offset {} completed during drain",
                    self.key, in_flight.offset
                );
                self.complete(in_flight, completion)
            }
            Err(_) => {
                self.statistics.record_drain_timeout();
                let worker_index = in_flight.handle.index();
                let timed_out = TriggerError::DrainTimeout {
                    timeout_ms: config::millis(timeout),
                };

                if !in_flight.handle.supports_restart() {
                    let err = TriggerError::fatal(format!(
                        "{} on {} offset {} and worker {} cannot be restarted",
                        timed_out, self.key, in_flight.offset, worker_index
                    ));
                    (self.fatal_hook)(&err);

                    // the process is expected to terminate; return the worker so teardown does not block on it
                    let _ = self
                        .generation
                        .allocator
                        .release(in_flight.cookie, in_flight.handle);
                    return Err(err);
                }

                warn!(
                    "{} on {} offset {}, restarting worker {}",
                    timed_out, self.key, in_flight.offset, worker_index
                );

                if let Err(e) = in_flight.handle.restart().await {
                    let err = TriggerError::fatal(format!(
                        "Failed to restart worker {}: {}",
                        worker_index, e
                    ));
                    (self.fatal_hook)(&err);
                    let _ = self
                        .generation
                        .allocator
                        .release(in_flight.cookie, in_flight.handle);
                    return Err(err);
                }
                self.statistics.record_worker_restart();

                // let the cancelled invocation settle before the worker is reused; its
                // result is never committed
                if tokio::time::timeout(timeout, &mut in_flight.done).await.is_err() {
                    warn!(
                        "Worker {} did not report the cancelled invocation of {} offset {}",
                        worker_index, self.key, in_flight.offset
                    );
                }

                self.generation
                    .allocator
                    .release(in_flight.cookie, in_flight.handle)
            }
        }
    }

    async fn stop_submitter(&self, task: JoinHandle<()>, result: &Result<()>) {
        // a fatal drain leaves the submitter stuck in an invocation that will never end
        if matches!(result, Err(e) if e.is_fatal()) {
            task.abort();
            return;
        }

        if let Err(e) = task.await {
            warn!("Event submitter for {} failed: {}", self.key, e);
        }
    }
}
