//! # FluxMQ Trigger
//!
//! Partitioned-stream consumption engine for function triggers. A trigger joins a
//! consumer group, hands the records of every claimed partition to a bounded pool of
//! function workers and commits offsets with at-least-once guarantees, while surviving
//! consumer group rebalances without losing in-flight work or breaking per-partition
//! ordering.
//!
//! ## Architecture Overview
//!
//! - [`trigger`] - Trigger lifecycle, retry loop and the per-partition consumption
//!   protocol, including the rebalance drain
//! - [`partitionworker`] - Mapping of partitions onto pooled workers (pooled or static)
//! - [`commit`] - Commit offset computation and the ack window
//! - [`worker`] - Worker and worker pool abstractions
//! - [`control`] - Control channel carrying explicit acks from functions
//! - [`broker`] - Consumer group adapter traits
//! - [`memory`] - In-process consumer group implementing the adapter traits
//! - [`metrics`] - Trigger statistics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxmq_trigger::config::{AllocationMode, TriggerConfigBuilder};
//! use fluxmq_trigger::event::Response;
//! use fluxmq_trigger::memory::MemoryBroker;
//! use fluxmq_trigger::worker::{FixedWorkerPool, HandlerWorker, Worker};
//! use fluxmq_trigger::Trigger;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     broker.create_stream("orders", 4)?;
//!
//!     let workers = (0..2)
//!         .map(|index| {
//!             Arc::new(HandlerWorker::new(index, |event, _ctx| async move {
//!                 Ok(Response::ok(event.body().clone()))
//!             })) as Arc<dyn Worker>
//!         })
//!         .collect();
//!     let pool = Arc::new(FixedWorkerPool::new(workers)?);
//!
//!     let config = TriggerConfigBuilder::new()
//!         .consumer_group("billing")
//!         .topics(["orders"])
//!         .worker_allocation_mode(AllocationMode::Static)
//!         .build();
//!
//!     let trigger = Trigger::new(config, pool, broker.consumer_group("billing", "member-1"))?;
//!     trigger.start(None)?;
//!
//!     broker.produce("orders", 0, "hello")?;
//!
//!     trigger.stop(false).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod commit;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod memory;
pub mod metrics;
pub mod partitionworker;
pub mod trigger;
pub mod worker;

pub use broker::{Claim, ConsumerGroup, ConsumerGroupHandler, GroupSession};
pub use commit::{CommitPolicy, CommitState, Completion};
pub use config::{
    AllocationMode, BalanceStrategy, ExplicitAckMode, InitialOffset, TriggerConfig,
    TriggerConfigBuilder,
};
pub use control::ControlChannel;
pub use error::TriggerError;
pub use event::{ControlMessage, Event, PartitionKey, Record, Response};
pub use memory::{MemoryBroker, MemoryConsumerGroup, MemorySession};
pub use metrics::{StatisticsSnapshot, TriggerStatistics};
pub use partitionworker::{AllocationCookie, PartitionWorkerAllocator};
pub use trigger::{
    ConsumptionSession, EventSubmitter, ExplicitAckHandler, FatalHook, PartitionConsumer,
    Trigger, TriggerState,
};
pub use worker::{FixedWorkerPool, HandlerWorker, Worker, WorkerHandle, WorkerPool};

/// Result type alias for trigger operations
pub type Result<T> = std::result::Result<T, TriggerError>;
