//! Consumer group adapter interface
//!
//! A broker adapter exposes consumer-group generations as a [`GroupSession`] plus one
//! [`Claim`] per assigned partition. The trigger drives them through a
//! [`ConsumerGroupHandler`]: `setup` once per generation, `consume_claim` once per claim
//! (concurrently), then `cleanup` after every claim has returned.

use crate::config::TriggerConfig;
use crate::event::{Offset, PartitionId, PartitionKey, Record};
use crate::partitionworker::StreamPartitions;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One generation of group membership
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    fn generation_id(&self) -> i32;

    /// Partitions claimed by this member, per stream
    fn claims(&self) -> StreamPartitions;

    /// Cancelled when the generation ends (rebalance or shutdown)
    fn cancellation(&self) -> CancellationToken;

    /// Mark `offset` as the next offset to consume for a partition
    fn mark_offset(&self, stream: &str, partition: PartitionId, offset: Offset) -> Result<()>;
}

/// Ownership of one partition for the current generation
#[derive(Debug)]
pub struct Claim {
    pub key: PartitionKey,
    pub initial_offset: Offset,
    /// Closed by the adapter when the generation ends
    pub records: mpsc::Receiver<Record>,
}

impl Claim {
    pub fn new(key: PartitionKey, initial_offset: Offset, records: mpsc::Receiver<Record>) -> Self {
        Self {
            key,
            initial_offset,
            records,
        }
    }
}

#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()>;

    async fn consume_claim(&self, session: Arc<dyn GroupSession>, claim: Claim) -> Result<()>;

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<()>;
}

#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Join the group and run one generation to completion. `config` carries the
    /// topics plus the adapter settings (initial offset, balance strategy).
    async fn consume(&self, config: &TriggerConfig, handler: Arc<dyn ConsumerGroupHandler>)
        -> Result<()>;

    /// Leave the group; a running `consume` returns
    async fn close(&self) -> Result<()>;
}
