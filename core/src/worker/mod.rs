//! Function workers and the pool they are borrowed from
//!
//! A [`Worker`] runs one function invocation at a time. Workers live in a
//! [`WorkerPool`]; callers borrow one as a [`WorkerHandle`] and must hand it back
//! through [`WorkerPool::release`]. A handle that is dropped instead of released is
//! lost to the pool.

pub mod handler;

pub use handler::{FunctionContext, HandlerWorker};

use crate::control::ControlChannel;
use crate::error::TriggerError;
use crate::event::{Event, Response};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// An execution slot capable of running one invocation at a time
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    /// Stable identity of this worker within its pool
    fn index(&self) -> usize;

    /// Run the function on one event
    async fn invoke(&self, event: Event) -> Result<Response>;

    /// Whether `restart` can cancel an in-flight invocation
    fn supports_restart(&self) -> bool {
        false
    }

    /// Discard the execution context, cancelling any in-flight invocation
    async fn restart(&self) -> Result<()> {
        Err(TriggerError::RestartUnsupported {
            index: self.index(),
        })
    }

    /// Stop accepting work until `resume`
    async fn drain(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Channel on which the function publishes control messages, if any
    fn control_channel(&self) -> Option<Arc<ControlChannel>> {
        None
    }
}

/// Exclusive borrow of a pooled worker
pub struct WorkerHandle {
    worker: Arc<dyn Worker>,
}

impl WorkerHandle {
    /// Wrap a worker taken out of a pool. Only pool implementations should call this.
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self { worker }
    }

    pub fn index(&self) -> usize {
        self.worker.index()
    }

    /// Shared reference for the task that runs the invocation
    pub(crate) fn shared(&self) -> Arc<dyn Worker> {
        self.worker.clone()
    }

    /// Give the worker back to its pool implementation
    pub fn into_inner(self) -> Arc<dyn Worker> {
        self.worker
    }
}

impl Deref for WorkerHandle {
    type Target = dyn Worker;

    fn deref(&self) -> &Self::Target {
        self.worker.as_ref()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.worker.index())
            .finish()
    }
}

/// Fixed set of execution slots
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Borrow a worker. `None` blocks, `Some(0)` fails at once when none is free,
    /// `Some(d)` waits up to `d`. Exhaustion yields [`TriggerError::NoAvailableWorkers`].
    async fn allocate(&self, timeout: Option<Duration>) -> Result<WorkerHandle>;

    fn release(&self, handle: WorkerHandle);

    /// Every worker owned by the pool, borrowed or not
    fn workers(&self) -> Vec<Arc<dyn Worker>>;

    fn num_workers_available(&self) -> usize;

    /// Tell every worker to stop accepting work
    async fn signal_drain(&self) -> Result<()> {
        for worker in self.workers() {
            worker.drain().await?;
        }
        Ok(())
    }

    /// Tell every worker to accept work again
    async fn signal_continue(&self) -> Result<()> {
        for worker in self.workers() {
            worker.resume().await?;
        }
        Ok(())
    }
}

/// Worker pool over a fixed list of workers
pub struct FixedWorkerPool {
    workers: Vec<Arc<dyn Worker>>,
    free_tx: mpsc::Sender<Arc<dyn Worker>>,
    free_rx: Mutex<mpsc::Receiver<Arc<dyn Worker>>>,
    available: AtomicUsize,
}

impl FixedWorkerPool {
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Result<Self> {
        if workers.is_empty() {
            return Err(TriggerError::invalid_config(
                "Worker pool must contain at least one worker",
            ));
        }

        let (free_tx, free_rx) = mpsc::channel(workers.len());
        for worker in &workers {
            free_tx
                .try_send(worker.clone())
                .map_err(|_| TriggerError::worker("Failed to seed worker pool"))?;
        }

        debug!("Created worker pool with {} workers", workers.len());

        Ok(Self {
            available: AtomicUsize::new(workers.len()),
            workers,
            free_tx,
            free_rx: Mutex::new(free_rx),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

#[async_trait]
impl WorkerPool for FixedWorkerPool {
    async fn allocate(&self, timeout: Option<Duration>) -> Result<WorkerHandle> {
        let worker = match timeout {
            None => {
                let mut free_rx = self.free_rx.lock().await;
                free_rx.recv().await.ok_or(TriggerError::Closed)?
            }
            Some(timeout) if timeout.is_zero() => {
                let mut free_rx = self
                    .free_rx
                    .try_lock()
                    .map_err(|_| TriggerError::NoAvailableWorkers)?;
                free_rx
                    .try_recv()
                    .map_err(|_| TriggerError::NoAvailableWorkers)?
            }
            Some(timeout) => tokio::time::timeout(timeout, async {
                let mut free_rx = self.free_rx.lock().await;
                free_rx.recv().await
            })
            .await
            .map_err(|_| TriggerError::NoAvailableWorkers)?
            .ok_or(TriggerError::Closed)?,
        };

        self.available.fetch_sub(1, Ordering::SeqCst);
        Ok(WorkerHandle::new(worker))
    }

    fn release(&self, handle: WorkerHandle) {
        let index = handle.index();
        match self.free_tx.try_send(handle.into_inner()) {
            Ok(()) => {
                self.available.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => warn!("Worker {} released to a full pool, ignoring", index),
        }
    }

    fn workers(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.clone()
    }

    fn num_workers_available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }
}
