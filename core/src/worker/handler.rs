//! Worker backed by an async handler function
//!
//! Every invocation runs on its own tokio task. Restarting the worker aborts that
//! task, which is how a stuck handler gets cancelled: the execution context is thrown
//! away rather than preempted in place.

use super::Worker;
use crate::control::ControlChannel;
use crate::error::TriggerError;
use crate::event::{ControlMessage, Event, Offset, PartitionKey, Response};
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

type HandlerFn = dyn Fn(Event, FunctionContext) -> BoxFuture<'static, Result<Response>> + Send + Sync;

/// Runtime services handed to the function on every invocation
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub worker_index: usize,
    control: Arc<ControlChannel>,
}

impl FunctionContext {
    /// Explicitly acknowledge `offset` on a partition
    pub fn ack(&self, key: PartitionKey, offset: Offset) {
        let delivered = self.control.publish(ControlMessage::ack(key.clone(), offset));
        debug!(
            "Worker {} published ack for {} offset {} to {} subscribers",
            self.worker_index, key, offset, delivered
        );
    }

    pub fn control_channel(&self) -> &Arc<ControlChannel> {
        &self.control
    }
}

pub struct HandlerWorker {
    index: usize,
    handler: Arc<HandlerFn>,
    control: Arc<ControlChannel>,
    in_flight: Mutex<Option<AbortHandle>>,
    draining: AtomicBool,
    restarts: AtomicU64,
}

impl HandlerWorker {
    pub fn new<F, Fut>(index: usize, handler: F) -> Self
    where
        F: Fn(Event, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self {
            index,
            handler: Arc::new(move |event: Event, ctx: FunctionContext| handler(event, ctx).boxed()),
            control: Arc::new(ControlChannel::new()),
            in_flight: Mutex::new(None),
            draining: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for HandlerWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerWorker")
            .field("index", &self.index)
            .field("draining", &self.is_draining())
            .field("restarts", &self.restart_count())
            .finish()
    }
}

#[async_trait]
impl Worker for HandlerWorker {
    fn index(&self) -> usize {
        self.index
    }

    async fn invoke(&self, event: Event) -> Result<Response> {
        if self.is_draining() {
            return Err(TriggerError::worker(format!(
                "Worker {} is draining",
                self.index
            )));
        }

        let ctx = FunctionContext {
            worker_index: self.index,
            control: self.control.clone(),
        };
        let task = tokio::spawn((self.handler)(event, ctx));
        *self.in_flight.lock() = Some(task.abort_handle());

        let outcome = task.await;
        self.in_flight.lock().take();

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TriggerError::processing(format!(
                "Invocation on worker {} cancelled by restart",
                self.index
            ))),
            Err(e) => {
                warn!("Handler on worker {} panicked: {}", self.index, e);
                Err(TriggerError::processing(format!("Handler panicked: {}", e)))
            }
        }
    }

    fn supports_restart(&self) -> bool {
        true
    }

    async fn restart(&self) -> Result<()> {
        if let Some(abort) = self.in_flight.lock().take() {
            abort.abort();
        }
        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Worker {} restarted ({} total)", self.index, restarts);
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.draining.store(true, Ordering::SeqCst);
        debug!("Worker {} draining", self.index);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.draining.store(false, Ordering::SeqCst);
        debug!("Worker {} resumed", self.index);
        Ok(())
    }

    fn control_channel(&self) -> Option<Arc<ControlChannel>> {
        Some(self.control.clone())
    }
}
