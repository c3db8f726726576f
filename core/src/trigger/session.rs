use super::consumer::PartitionConsumer;
use super::{abort_on_fatal, FatalHook, TriggerState};
use crate::broker::{Claim, ConsumerGroupHandler, GroupSession};
use crate::config::TriggerConfig;
use crate::error::TriggerError;
use crate::metrics::TriggerStatistics;
use crate::partitionworker::PartitionWorkerAllocator;
use crate::worker::WorkerPool;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-generation state shared by the partition consumers of one session
pub(crate) struct Generation {
    pub(crate) id: i32,
    pub(crate) allocator: PartitionWorkerAllocator,
    drain_signaled: AtomicBool,
}

impl Generation {
    /// True for exactly one caller per generation
    pub(crate) fn begin_drain(&self) -> bool {
        !self.drain_signaled.swap(true, Ordering::SeqCst)
    }
}

/// Consumer group handler driving one trigger's generations
pub struct ConsumptionSession {
    config: Arc<TriggerConfig>,
    pool: Arc<dyn WorkerPool>,
    statistics: Arc<TriggerStatistics>,
    fatal_hook: FatalHook,
    state: Arc<RwLock<TriggerState>>,
    generation: RwLock<Option<Arc<Generation>>>,
}

impl ConsumptionSession {
    pub fn new(
        config: Arc<TriggerConfig>,
        pool: Arc<dyn WorkerPool>,
        statistics: Arc<TriggerStatistics>,
    ) -> Self {
        Self::with_state(
            config,
            pool,
            statistics,
            abort_on_fatal(),
            Arc::new(RwLock::new(TriggerState::Created)),
        )
    }

    pub(crate) fn with_state(
        config: Arc<TriggerConfig>,
        pool: Arc<dyn WorkerPool>,
        statistics: Arc<TriggerStatistics>,
        fatal_hook: FatalHook,
        state: Arc<RwLock<TriggerState>>,
    ) -> Self {
        Self {
            config,
            pool,
            statistics,
            fatal_hook,
            state,
            generation: RwLock::new(None),
        }
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    fn current_generation(&self) -> Result<Arc<Generation>> {
        self.generation
            .read()
            .clone()
            .ok_or_else(|| TriggerError::consumer_group("Claim consumed outside of a session"))
    }
}

#[async_trait]
impl ConsumerGroupHandler for ConsumptionSession {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        let claims = session.claims();

        info!(
            "Starting consumer session (claims: {:?}, member id: {}, generation: {}, workers available: {})",
            claims,
            session.member_id(),
            session.generation_id(),
            self.pool.num_workers_available()
        );

        let allocator = PartitionWorkerAllocator::new(
            self.config.worker_allocation_mode,
            self.pool.clone(),
            &claims,
        )
        .await
        .map_err(|e| {
            TriggerError::consumer_group(format!(
                "Failed to create partition worker allocator: {}",
                e
            ))
        })?;

        *self.generation.write() = Some(Arc::new(Generation {
            id: session.generation_id(),
            allocator,
            drain_signaled: AtomicBool::new(false),
        }));
        *self.state.write() = TriggerState::Consuming {
            generation: session.generation_id(),
        };
        self.statistics.record_session_started();

        Ok(())
    }

    async fn consume_claim(&self, session: Arc<dyn GroupSession>, claim: Claim) -> Result<()> {
        let generation = self.current_generation()?;

        debug!(
            "Consuming claim {} from offset {} (generation: {})",
            claim.key, claim.initial_offset, generation.id
        );

        PartitionConsumer::new(
            claim.key,
            claim.initial_offset,
            session,
            generation,
            self.pool.clone(),
            self.config.clone(),
            self.statistics.clone(),
            self.fatal_hook.clone(),
        )
        .run(claim.records)
        .await
    }

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        let generation = self.generation.write().take();

        if let Some(generation) = generation {
            generation.allocator.stop().await.map_err(|e| {
                TriggerError::consumer_group(format!(
                    "Failed to stop partition worker allocator: {}",
                    e
                ))
            })?;
        }

        info!(
            "Ending consumer session (claims: {:?}, member id: {}, workers available: {})",
            session.claims(),
            session.member_id(),
            self.pool.num_workers_available()
        );

        Ok(())
    }
}
