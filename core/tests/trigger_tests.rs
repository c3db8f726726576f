mod common;

use async_trait::async_trait;
use common::{eventually, init_tracing, pool_of, recording_hook, STREAM};
use fluxmq_trigger::config::{AllocationMode, ExplicitAckMode, InitialOffset, TriggerConfigBuilder};
use fluxmq_trigger::event::{Event, Response};
use fluxmq_trigger::memory::{MemoryBroker, MemoryConsumerGroup};
use fluxmq_trigger::metrics::global_statistics;
use fluxmq_trigger::worker::{HandlerWorker, Worker, WorkerHandle, WorkerPool};
use fluxmq_trigger::{Result, Trigger, TriggerConfig, TriggerError, TriggerState};
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "billing";
const PARTITIONS: i32 = 4;

fn config(mode: AllocationMode) -> TriggerConfig {
    TriggerConfigBuilder::new()
        .consumer_group(GROUP)
        .topics([STREAM])
        .worker_allocation_mode(mode)
        .initial_offset(InitialOffset::Earliest)
        .retry_backoff(Duration::from_millis(10))
        .max_wait_handler_during_rebalance(Duration::from_millis(500))
        .build()
}

fn workers(count: usize) -> Arc<dyn WorkerPool> {
    pool_of(
        (0..count)
            .map(|index| {
                Arc::new(HandlerWorker::new(index, |event: Event, _ctx| async move {
                    Ok(Response::ok(event.body().clone()))
                })) as Arc<dyn Worker>
            })
            .collect(),
    )
}

fn member(broker: &MemoryBroker, name: &str) -> MemoryConsumerGroup {
    broker.consumer_group(GROUP, name)
}

fn produce(broker: &MemoryBroker, per_partition: usize) {
    for partition in 0..PARTITIONS {
        for _ in 0..per_partition {
            broker.produce(STREAM, partition, "payload").unwrap();
        }
    }
}

fn all_committed(broker: &MemoryBroker, offset: i64) -> bool {
    (0..PARTITIONS).all(|partition| broker.committed(GROUP, STREAM, partition) == Some(offset))
}

#[tokio::test]
async fn test_consumes_and_survives_rebalance() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.create_stream(STREAM, PARTITIONS as usize).unwrap();
    produce(&broker, 5);

    let (hook, fatal_errors) = recording_hook();
    let first = Trigger::new(config(AllocationMode::Static), workers(2), member(&broker, "member-a"))
        .unwrap()
        .with_fatal_hook(hook.clone());
    first.start(None).unwrap();

    assert!(eventually(|| all_committed(&broker, 5)).await);
    assert!(matches!(first.state(), TriggerState::Consuming { generation: 1 }));

    // a second member joins: partitions are split between both
    let second = Trigger::new(config(AllocationMode::Static), workers(2), member(&broker, "member-b"))
        .unwrap()
        .with_fatal_hook(hook);
    second.start(None).unwrap();

    assert!(eventually(|| broker.generation(GROUP) == 2).await);
    assert!(eventually(|| matches!(second.state(), TriggerState::Consuming { generation: 2 })).await);
    assert!(eventually(|| matches!(first.state(), TriggerState::Consuming { generation: 2 })).await);

    produce(&broker, 5);
    assert!(eventually(|| all_committed(&broker, 10)).await);

    let first_stats = first.statistics();
    let second_stats = second.statistics();
    assert!(first_stats.sessions_started >= 2);
    assert_eq!(
        first_stats.events_handled_success + second_stats.events_handled_success,
        40
    );

    assert_eq!(first.stop(false).await.unwrap(), None);
    assert_eq!(first.state(), TriggerState::Stopped);
    second.stop(false).await.unwrap();
    assert_eq!(second.state(), TriggerState::Stopped);

    assert!(broker.members(GROUP).is_empty());
    assert!(fatal_errors.lock().is_empty());
}

#[tokio::test]
async fn test_pooled_trigger_with_shared_statistics() {
    let broker = MemoryBroker::new();
    broker.create_stream(STREAM, PARTITIONS as usize).unwrap();
    produce(&broker, 3);

    let statistics = global_statistics();
    let before = statistics.snapshot().events_handled_success;

    let trigger = Trigger::new(config(AllocationMode::Pool), workers(1), member(&broker, "member-a"))
        .unwrap()
        .with_statistics(statistics.clone());
    trigger.start(None).unwrap();

    assert!(eventually(|| all_committed(&broker, 3)).await);
    assert!(statistics.snapshot().events_handled_success >= before + 12);

    trigger.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_initial_offset_comes_from_trigger_config() {
    let broker = MemoryBroker::new();
    broker.create_stream(STREAM, 1).unwrap();
    broker.produce(STREAM, 0, "before start").unwrap();

    let earliest = Trigger::new(config(AllocationMode::Pool), workers(1), member(&broker, "member-a")).unwrap();
    earliest.start(None).unwrap();
    assert!(eventually(|| broker.committed(GROUP, STREAM, 0) == Some(1)).await);
    earliest.stop(false).await.unwrap();

    // a group without commits starting from latest skips what is already there
    let mut latest_config = config(AllocationMode::Pool);
    latest_config.consumer_group = "audit".to_string();
    latest_config.initial_offset = InitialOffset::Latest;
    let latest = Trigger::new(latest_config, workers(1), broker.consumer_group("audit", "member-a")).unwrap();
    latest.start(None).unwrap();
    assert!(eventually(|| matches!(latest.state(), TriggerState::Consuming { .. })).await);

    broker.produce(STREAM, 0, "after start").unwrap();
    assert!(eventually(|| broker.committed("audit", STREAM, 0) == Some(2)).await);
    assert_eq!(latest.statistics().events_handled_success, 1);
    latest.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_retries_unknown_stream_until_stopped() {
    let broker = MemoryBroker::new();
    let trigger = Trigger::new(config(AllocationMode::Pool), workers(1), member(&broker, "member-a")).unwrap();
    trigger.start(None).unwrap();

    assert!(eventually(|| trigger.statistics().connection_failures >= 3).await);

    trigger.stop(false).await.unwrap();
    assert_eq!(trigger.state(), TriggerState::Stopped);
}

#[test]
fn test_enable_ack_with_pooled_allocation_is_rejected() {
    let config = TriggerConfigBuilder::new()
        .consumer_group(GROUP)
        .topics([STREAM])
        .worker_allocation_mode(AllocationMode::Pool)
        .explicit_ack_mode(ExplicitAckMode::Enable)
        .build();

    let broker = MemoryBroker::new();
    let result = Trigger::new(config, workers(1), member(&broker, "member-a"));
    assert!(matches!(result, Err(TriggerError::InvalidConfig { .. })));
}

struct EmptyPool;

#[async_trait]
impl WorkerPool for EmptyPool {
    async fn allocate(&self, _timeout: Option<Duration>) -> Result<WorkerHandle> {
        Err(TriggerError::NoAvailableWorkers)
    }

    fn release(&self, _handle: WorkerHandle) {}

    fn workers(&self) -> Vec<Arc<dyn Worker>> {
        Vec::new()
    }

    fn num_workers_available(&self) -> usize {
        0
    }
}

#[test]
fn test_empty_worker_pool_is_rejected() {
    let broker = MemoryBroker::new();
    let result = Trigger::new(
        config(AllocationMode::Static),
        Arc::new(EmptyPool),
        member(&broker, "member-a"),
    );
    assert!(matches!(result, Err(TriggerError::InvalidConfig { .. })));
}
