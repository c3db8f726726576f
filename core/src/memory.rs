//! In-process consumer group
//!
//! [`MemoryBroker`] keeps partitioned streams, consumer group membership and committed
//! offsets in memory and implements the broker adapter traits on top of them. It is
//! meant for tests and for embedding the trigger without an external broker.
//!
//! Membership changes are rebalances: a member joining or leaving bumps the group
//! generation and cancels every live session of the group, so their `consume` calls
//! return and the members join again with the new assignment.

use crate::broker::{Claim, ConsumerGroup, ConsumerGroupHandler, GroupSession};
use crate::config::{BalanceStrategy, InitialOffset, TriggerConfig};
use crate::error::TriggerError;
use crate::event::{Offset, PartitionId, PartitionKey, Record};
use crate::partitionworker::StreamPartitions;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Records buffered per claim between the partition log and the consumer
const CLAIM_BUFFER_SIZE: usize = 64;

type CommittedOffsets = Arc<Mutex<HashMap<PartitionKey, Offset>>>;

#[derive(Default)]
struct PartitionLog {
    records: Vec<Record>,
    appended: Arc<Notify>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeSet<String>,
    generation: i32,
    committed: CommittedOffsets,
    sessions: HashMap<u64, CancellationToken>,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, Vec<PartitionLog>>,
    groups: HashMap<String, GroupState>,
    next_session: u64,
}

impl GroupState {
    /// Start a new generation, ending every session of the old one
    fn rebalance(&mut self) {
        self.generation += 1;
        for token in self.sessions.values() {
            token.cancel();
        }
    }
}

/// In-memory partitioned streams with consumer groups
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_stream(&self, stream: &str, partitions: usize) -> Result<()> {
        if partitions == 0 {
            return Err(TriggerError::invalid_config(format!(
                "Stream {} must have at least one partition",
                stream
            )));
        }

        let mut state = self.state.lock();
        if state.streams.contains_key(stream) {
            return Err(TriggerError::invalid_config(format!(
                "Stream {} already exists",
                stream
            )));
        }

        state.streams.insert(
            stream.to_string(),
            (0..partitions).map(|_| PartitionLog::default()).collect(),
        );
        debug!("Created stream {} with {} partitions", stream, partitions);
        Ok(())
    }

    /// Append a record; returns its offset
    pub fn produce<V: Into<Bytes>>(
        &self,
        stream: &str,
        partition: PartitionId,
        payload: V,
    ) -> Result<Offset> {
        let mut state = self.state.lock();
        let log = partition_log(&mut state, stream, partition)?;

        let offset = log.records.len() as Offset;
        log.records
            .push(Record::new(PartitionKey::new(stream, partition), offset, payload));
        log.appended.notify_waiters();

        Ok(offset)
    }

    /// Next offset the group will consume from a partition, if it committed one
    pub fn committed(&self, group: &str, stream: &str, partition: PartitionId) -> Option<Offset> {
        let state = self.state.lock();
        let group = state.groups.get(group)?;
        let committed = group.committed.lock();
        committed.get(&PartitionKey::new(stream, partition)).copied()
    }

    pub fn generation(&self, group: &str) -> i32 {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|group| group.generation)
            .unwrap_or(0)
    }

    pub fn members(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|group| group.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handle through which `member` takes part in `group`
    pub fn consumer_group(&self, group: &str, member: &str) -> MemoryConsumerGroup {
        MemoryConsumerGroup {
            broker: self.clone(),
            group: group.to_string(),
            member: member.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    fn partition_count(&self, stream: &str) -> Result<usize> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|partitions| partitions.len())
            .ok_or_else(|| TriggerError::consumer_group(format!("Unknown stream: {}", stream)))
    }
}

fn partition_log<'a>(
    state: &'a mut BrokerState,
    stream: &str,
    partition: PartitionId,
) -> Result<&'a mut PartitionLog> {
    state
        .streams
        .get_mut(stream)
        .and_then(|partitions| usize::try_from(partition).ok().and_then(|p| partitions.get_mut(p)))
        .ok_or_else(|| {
            TriggerError::consumer_group(format!("Unknown partition {}/{}", stream, partition))
        })
}

/// Assign partitions of `topics` to sorted `members`
fn assign(
    strategy: BalanceStrategy,
    members: &[String],
    topics: &[(String, usize)],
) -> HashMap<String, StreamPartitions> {
    let mut assignments: HashMap<String, StreamPartitions> = members
        .iter()
        .map(|member| (member.clone(), StreamPartitions::new()))
        .collect();

    if members.is_empty() {
        return assignments;
    }

    match strategy {
        BalanceStrategy::RoundRobin => {
            let partitions = topics.iter().flat_map(|(topic, count)| {
                (0..*count).map(move |partition| (topic.clone(), partition as PartitionId))
            });

            for (index, (topic, partition)) in partitions.enumerate() {
                let member = &members[index % members.len()];
                if let Some(claims) = assignments.get_mut(member) {
                    claims.entry(topic).or_default().push(partition);
                }
            }
        }
        // no prior assignment is tracked, so sticky starts from a range assignment
        BalanceStrategy::Range | BalanceStrategy::Sticky => {
            for (topic, count) in topics {
                let per_member = count / members.len();
                let remainder = count % members.len();

                let mut partition = 0;
                for (member_index, member) in members.iter().enumerate() {
                    let extra = usize::from(member_index < remainder);
                    let range = partition..partition + per_member + extra;
                    partition = range.end;

                    if range.is_empty() {
                        continue;
                    }
                    if let Some(claims) = assignments.get_mut(member) {
                        claims
                            .entry(topic.clone())
                            .or_default()
                            .extend(range.map(|p| p as PartitionId));
                    }
                }
            }
        }
    }

    assignments
}

/// One member's view of a consumer group on a [`MemoryBroker`]
pub struct MemoryConsumerGroup {
    broker: MemoryBroker,
    group: String,
    member: String,
    closed: AtomicBool,
}

impl MemoryConsumerGroup {
    pub fn member_id(&self) -> &str {
        &self.member
    }

    /// Join (if needed) and open a session for the current generation
    fn join(&self, config: &TriggerConfig) -> Result<(u64, Arc<MemorySession>, Vec<Claim>)> {
        let mut topic_sizes = Vec::with_capacity(config.topics.len());
        for topic in &config.topics {
            topic_sizes.push((topic.clone(), self.broker.partition_count(topic)?));
        }
        topic_sizes.sort();

        let mut state = self.broker.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(TriggerError::Closed);
        }
        let session_id = state.next_session;
        state.next_session += 1;

        let group = state.groups.entry(self.group.clone()).or_default();
        if group.members.insert(self.member.clone()) {
            info!(
                "Member {} joined group {}, rebalancing",
                self.member, self.group
            );
            group.rebalance();
        }

        let members: Vec<String> = group.members.iter().cloned().collect();
        let claims = assign(config.balance_strategy, &members, &topic_sizes)
            .remove(&self.member)
            .unwrap_or_default();

        let cancellation = CancellationToken::new();
        group.sessions.insert(session_id, cancellation.clone());

        let session = Arc::new(MemorySession {
            member_id: self.member.clone(),
            generation_id: group.generation,
            claims: claims.clone(),
            cancellation: cancellation.clone(),
            committed: group.committed.clone(),
        });
        let committed = group.committed.clone();

        let mut claim_streams = Vec::new();
        for (stream, partitions) in &claims {
            for partition in partitions {
                let key = PartitionKey::new(stream.as_str(), *partition);
                let log = partition_log(&mut state, stream, *partition)?;
                let start = match committed.lock().get(&key) {
                    Some(offset) => *offset,
                    None => match config.initial_offset {
                        InitialOffset::Earliest => 0,
                        InitialOffset::Latest => log.records.len() as Offset,
                    },
                };

                let (tx, rx) = mpsc::channel(CLAIM_BUFFER_SIZE);
                tokio::spawn(feed_claim(
                    self.broker.clone(),
                    key.clone(),
                    start,
                    log.appended.clone(),
                    tx,
                    cancellation.clone(),
                ));
                claim_streams.push(Claim::new(key, start, rx));
            }
        }

        Ok((session_id, session, claim_streams))
    }

    fn end_session(&self, session_id: u64) {
        let mut state = self.broker.state.lock();
        if let Some(group) = state.groups.get_mut(&self.group) {
            if let Some(token) = group.sessions.remove(&session_id) {
                token.cancel();
            }
        }
    }
}

/// Copy records of one partition into a claim until the session ends
async fn feed_claim(
    broker: MemoryBroker,
    key: PartitionKey,
    mut next: Offset,
    appended: Arc<Notify>,
    records: mpsc::Sender<Record>,
    cancellation: CancellationToken,
) {
    loop {
        let notified = appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let pending: Vec<Record> = {
            let mut state = broker.state.lock();
            match partition_log(&mut state, &key.stream, key.partition) {
                Ok(log) => log
                    .records
                    .get(usize::try_from(next).unwrap_or(usize::MAX)..)
                    .map(|records| records.to_vec())
                    .unwrap_or_default(),
                Err(_) => return,
            }
        };

        if pending.is_empty() {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = &mut notified => continue,
            }
        }

        for record in pending {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                sent = records.send(record) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            next += 1;
        }
    }
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    async fn consume(&self, config: &TriggerConfig, handler: Arc<dyn ConsumerGroupHandler>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TriggerError::Closed);
        }

        let (session_id, session, claims) = self.join(config)?;
        let session: Arc<dyn GroupSession> = session;
        let cancellation = session.cancellation();

        if let Err(e) = handler.setup(session.clone()).await {
            self.end_session(session_id);
            return Err(e);
        }

        let idle = claims.is_empty();
        let results = join_all(
            claims
                .into_iter()
                .map(|claim| handler.consume_claim(session.clone(), claim)),
        )
        .await;

        // a member without claims still holds its session until the next rebalance
        if idle {
            cancellation.cancelled().await;
        }
        self.end_session(session_id);

        let cleanup = handler.cleanup(session).await;

        results.into_iter().collect::<Result<Vec<()>>>()?;
        cleanup
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut state = self.broker.state.lock();
        if let Some(group) = state.groups.get_mut(&self.group) {
            if group.members.remove(&self.member) {
                info!("Member {} left group {}, rebalancing", self.member, self.group);
                group.rebalance();
            }
        }
        Ok(())
    }
}

/// Session of one member in one generation
pub struct MemorySession {
    member_id: String,
    generation_id: i32,
    claims: StreamPartitions,
    cancellation: CancellationToken,
    committed: CommittedOffsets,
}

impl MemorySession {
    /// Standalone session, detached from any broker
    pub fn new(member_id: &str, generation_id: i32, claims: StreamPartitions) -> Self {
        Self {
            member_id: member_id.to_string(),
            generation_id,
            claims,
            cancellation: CancellationToken::new(),
            committed: CommittedOffsets::default(),
        }
    }

    /// End the session as a rebalance would
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn committed(&self, stream: &str, partition: PartitionId) -> Option<Offset> {
        self.committed
            .lock()
            .get(&PartitionKey::new(stream, partition))
            .copied()
    }
}

impl GroupSession for MemorySession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn claims(&self) -> StreamPartitions {
        self.claims.clone()
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn mark_offset(&self, stream: &str, partition: PartitionId, offset: Offset) -> Result<()> {
        let mut committed = self.committed.lock();
        let current = committed
            .entry(PartitionKey::new(stream, partition))
            .or_insert(offset);
        *current = (*current).max(offset);
        Ok(())
    }
}
