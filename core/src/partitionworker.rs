//! Mapping of partitions onto pooled workers
//!
//! Two policies are available:
//!
//! - **Pooled**: every partition shares the worker pool. Best throughput, but
//!   consecutive records of one partition may land on different workers.
//! - **Static**: the pool is split into one-worker slots and each claimed partition
//!   is pinned to a slot by its position among the stream's claimed partitions
//!   (`position % slots`). A given partition is always handled by the same worker for
//!   the lifetime of the allocator, which functions holding per-partition state rely
//!   on. The cost is that a partition pinned to a busy worker waits even when other
//!   workers are idle.
//!
//! Allocation returns an [`AllocationCookie`] that must accompany the release.

use crate::config::AllocationMode;
use crate::error::TriggerError;
use crate::event::PartitionId;
use crate::worker::{WorkerHandle, WorkerPool};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Claimed partitions per stream, in the order the broker handed them out
pub type StreamPartitions = BTreeMap<String, Vec<PartitionId>>;

/// Token returned with every allocation; identifies where the worker goes back to
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AllocationCookie {
    slot: Option<usize>,
}

pub enum PartitionWorkerAllocator {
    Pooled(PooledWorkerAllocator),
    Static(StaticWorkerAllocator),
}

impl PartitionWorkerAllocator {
    pub async fn new(
        mode: AllocationMode,
        pool: Arc<dyn WorkerPool>,
        partitions: &StreamPartitions,
    ) -> Result<Self> {
        match mode {
            AllocationMode::Pool => Ok(Self::Pooled(PooledWorkerAllocator::new(pool))),
            AllocationMode::Static => Ok(Self::Static(
                StaticWorkerAllocator::new(pool, partitions).await?,
            )),
        }
    }

    pub async fn allocate(
        &self,
        stream: &str,
        partition: PartitionId,
        timeout: Option<Duration>,
    ) -> Result<(WorkerHandle, AllocationCookie)> {
        match self {
            Self::Pooled(allocator) => allocator.allocate(timeout).await,
            Self::Static(allocator) => allocator.allocate(stream, partition, timeout).await,
        }
    }

    pub fn release(&self, cookie: AllocationCookie, handle: WorkerHandle) -> Result<()> {
        match self {
            Self::Pooled(allocator) => allocator.release(handle),
            Self::Static(allocator) => allocator.release(cookie, handle),
        }
    }

    /// Return every worker to the pool, waiting for outstanding borrows
    pub async fn stop(&self) -> Result<()> {
        match self {
            Self::Pooled(_) => Ok(()),
            Self::Static(allocator) => allocator.stop().await,
        }
    }

    pub fn mode(&self) -> AllocationMode {
        match self {
            Self::Pooled(_) => AllocationMode::Pool,
            Self::Static(_) => AllocationMode::Static,
        }
    }
}

/// Shares the whole pool between all partitions
pub struct PooledWorkerAllocator {
    pool: Arc<dyn WorkerPool>,
}

impl PooledWorkerAllocator {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        debug!("Created pooled partition worker allocator");
        Self { pool }
    }

    /// Partition identity is ignored
    pub async fn allocate(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(WorkerHandle, AllocationCookie)> {
        let handle = self.pool.allocate(timeout).await?;
        Ok((handle, AllocationCookie::default()))
    }

    pub fn release(&self, handle: WorkerHandle) -> Result<()> {
        self.pool.release(handle);
        Ok(())
    }
}

/// Capacity-one queue holding one dedicated worker
struct WorkerSlot {
    tx: mpsc::Sender<WorkerHandle>,
    rx: Mutex<mpsc::Receiver<WorkerHandle>>,
}

impl WorkerSlot {
    fn new(handle: WorkerHandle) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // a fresh capacity-one channel always has room
        let _ = tx.try_send(handle);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    async fn take(&self, timeout: Option<Duration>) -> Result<WorkerHandle> {
        match timeout {
            None => {
                let mut rx = self.rx.lock().await;
                rx.recv().await.ok_or(TriggerError::Closed)
            }
            Some(timeout) if timeout.is_zero() => {
                let mut rx = self
                    .rx
                    .try_lock()
                    .map_err(|_| TriggerError::NoAvailableWorkers)?;
                rx.try_recv().map_err(|_| TriggerError::NoAvailableWorkers)
            }
            Some(timeout) => tokio::time::timeout(timeout, async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            })
            .await
            .map_err(|_| TriggerError::NoAvailableWorkers)?
            .ok_or(TriggerError::Closed),
        }
    }
}

/// Pins every claimed partition to one worker
pub struct StaticWorkerAllocator {
    pool: Arc<dyn WorkerPool>,
    slots: Vec<WorkerSlot>,
    assignments: HashMap<String, HashMap<PartitionId, usize>>,
    stopped: AtomicBool,
}

impl StaticWorkerAllocator {
    /// Take every free worker out of the pool and divide them between the partitions
    pub async fn new(pool: Arc<dyn WorkerPool>, partitions: &StreamPartitions) -> Result<Self> {
        let mut slots = Vec::new();

        loop {
            match pool.allocate(Some(Duration::ZERO)).await {
                Ok(handle) => slots.push(WorkerSlot::new(handle)),
                Err(TriggerError::NoAvailableWorkers) => break,
                Err(e) => {
                    for slot in &slots {
                        if let Ok(handle) = slot.take(Some(Duration::ZERO)).await {
                            pool.release(handle);
                        }
                    }
                    return Err(e);
                }
            }
        }

        if slots.is_empty() {
            return Err(TriggerError::invalid_config(
                "No workers available in worker pool",
            ));
        }

        let mut assignments = HashMap::new();
        for (stream, partition_ids) in partitions {
            let stream_assignments: HashMap<PartitionId, usize> = partition_ids
                .iter()
                .enumerate()
                .map(|(position, partition)| (*partition, position % slots.len()))
                .collect();
            assignments.insert(stream.clone(), stream_assignments);
        }

        debug!(
            "Created static partition worker allocator with {} workers for {:?}",
            slots.len(),
            partitions
        );

        Ok(Self {
            pool,
            slots,
            assignments,
            stopped: AtomicBool::new(false),
        })
    }

    /// Slot a partition is pinned to
    pub fn slot_for(&self, stream: &str, partition: PartitionId) -> Option<usize> {
        self.assignments
            .get(stream)
            .and_then(|partitions| partitions.get(&partition))
            .copied()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub async fn allocate(
        &self,
        stream: &str,
        partition: PartitionId,
        timeout: Option<Duration>,
    ) -> Result<(WorkerHandle, AllocationCookie)> {
        let slot = self
            .slot_for(stream, partition)
            .ok_or_else(|| TriggerError::NoWorkerAssigned {
                stream: stream.to_string(),
                partition,
            })?;

        let handle = self.slots[slot].take(timeout).await?;
        Ok((handle, AllocationCookie { slot: Some(slot) }))
    }

    pub fn release(&self, cookie: AllocationCookie, handle: WorkerHandle) -> Result<()> {
        let slot = cookie
            .slot
            .and_then(|slot| self.slots.get(slot))
            .ok_or_else(|| TriggerError::invalid_cookie("Expected cookie to be a worker slot"))?;

        slot.tx
            .try_send(handle)
            .map_err(|_| TriggerError::invalid_cookie("Worker slot already holds its worker"))
    }

    /// Wait for every slot's worker and hand it back to the pool
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Releasing workers back to worker pool");

        for slot in &self.slots {
            let handle = slot.take(None).await?;
            self.pool.release(handle);
        }

        debug!(
            "Workers released back to worker pool (num: {})",
            self.slots.len()
        );

        Ok(())
    }
}
