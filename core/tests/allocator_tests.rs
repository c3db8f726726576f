mod common;

use common::{pool_of, STREAM};
use fluxmq_trigger::config::AllocationMode;
use fluxmq_trigger::event::Response;
use fluxmq_trigger::partitionworker::PartitionWorkerAllocator;
use fluxmq_trigger::worker::{HandlerWorker, Worker, WorkerPool};
use fluxmq_trigger::TriggerError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn workers(count: usize) -> Vec<Arc<dyn Worker>> {
    (0..count)
        .map(|index| {
            Arc::new(HandlerWorker::new(index, |_event, _ctx| async {
                Ok(Response::ok("ok"))
            })) as Arc<dyn Worker>
        })
        .collect()
}

fn claims(partitions: &[i32]) -> BTreeMap<String, Vec<i32>> {
    BTreeMap::from([(STREAM.to_string(), partitions.to_vec())])
}

#[tokio::test]
async fn test_static_assignment_is_stable() {
    let pool = pool_of(workers(2));
    let allocator =
        PartitionWorkerAllocator::new(AllocationMode::Static, pool.clone(), &claims(&[0, 1, 2, 3]))
            .await
            .unwrap();

    let mut indices = Vec::new();
    for partition in 0..4 {
        let (handle, cookie) = allocator.allocate(STREAM, partition, None).await.unwrap();
        indices.push(handle.index());
        allocator.release(cookie, handle).unwrap();
    }
    assert_eq!(indices, vec![0, 1, 0, 1]);

    for partition in 0..4 {
        let expected = indices[partition as usize];
        for _ in 0..100_000 {
            let (handle, cookie) = allocator.allocate(STREAM, partition, None).await.unwrap();
            assert_eq!(handle.index(), expected);
            allocator.release(cookie, handle).unwrap();
        }
    }

    allocator.stop().await.unwrap();
    assert_eq!(pool.num_workers_available(), 2);
}

#[tokio::test]
async fn test_static_zero_timeout_fails_immediately() {
    let pool = pool_of(workers(2));
    let allocator =
        PartitionWorkerAllocator::new(AllocationMode::Static, pool.clone(), &claims(&[0, 1, 2, 3]))
            .await
            .unwrap();

    // partitions 0 and 2 share worker 0
    let (held, cookie) = allocator.allocate(STREAM, 0, None).await.unwrap();

    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        allocator.allocate(STREAM, 2, Some(Duration::ZERO)),
    )
    .await
    .expect("zero-timeout allocation blocked");
    assert!(matches!(attempt, Err(TriggerError::NoAvailableWorkers)));

    // a partition pinned to the other worker is unaffected
    let (other, other_cookie) = allocator
        .allocate(STREAM, 1, Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(other.index(), 1);

    let timed = allocator
        .allocate(STREAM, 2, Some(Duration::from_millis(20)))
        .await;
    assert!(matches!(timed, Err(TriggerError::NoAvailableWorkers)));

    allocator.release(cookie, held).unwrap();
    allocator.release(other_cookie, other).unwrap();
    allocator.stop().await.unwrap();
}

#[tokio::test]
async fn test_static_with_more_workers_than_partitions() {
    let pool = pool_of(workers(4));
    let allocator =
        PartitionWorkerAllocator::new(AllocationMode::Static, pool.clone(), &claims(&[5, 9]))
            .await
            .unwrap();
    assert_eq!(pool.num_workers_available(), 0);

    let (first, first_cookie) = allocator.allocate(STREAM, 5, None).await.unwrap();
    let (second, second_cookie) = allocator.allocate(STREAM, 9, None).await.unwrap();
    assert_eq!((first.index(), second.index()), (0, 1));

    allocator.release(first_cookie, first).unwrap();
    allocator.release(second_cookie, second).unwrap();
    allocator.stop().await.unwrap();
    assert_eq!(pool.num_workers_available(), 4);
}

#[tokio::test]
async fn test_pooled_shares_workers_between_partitions() {
    let pool = pool_of(workers(1));
    let allocator =
        PartitionWorkerAllocator::new(AllocationMode::Pool, pool.clone(), &claims(&[0, 1]))
            .await
            .unwrap();

    let (held, cookie) = allocator.allocate(STREAM, 0, None).await.unwrap();
    let attempt = allocator.allocate(STREAM, 1, Some(Duration::ZERO)).await;
    assert!(matches!(attempt, Err(TriggerError::NoAvailableWorkers)));

    allocator.release(cookie, held).unwrap();
    let (handle, cookie) = allocator.allocate(STREAM, 1, Some(Duration::ZERO)).await.unwrap();
    assert_eq!(handle.index(), 0);
    allocator.release(cookie, handle).unwrap();
    allocator.stop().await.unwrap();
}
