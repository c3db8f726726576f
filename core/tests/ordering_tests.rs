mod common;

use common::{eventually, init_tracing, pool_of, ClaimHarness, STREAM};
use fluxmq_trigger::config::{AllocationMode, TriggerConfigBuilder};
use fluxmq_trigger::event::{Event, Offset, PartitionId, Response};
use fluxmq_trigger::worker::{HandlerWorker, Worker};
use fluxmq_trigger::TriggerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const RECORDS: i64 = 20;

fn pooled() -> TriggerConfigBuilder {
    TriggerConfigBuilder::new()
        .consumer_group("billing")
        .topics([STREAM])
        .worker_allocation_mode(AllocationMode::Pool)
}

/// Per-partition view of what the handlers are doing
#[derive(Default)]
struct Tracker {
    in_flight: HashMap<PartitionId, usize>,
    peak: HashMap<PartitionId, usize>,
    handled: HashMap<PartitionId, Vec<Offset>>,
}

fn slow_workers(count: usize, delay: Duration, tracker: Arc<Mutex<Tracker>>) -> Vec<Arc<dyn Worker>> {
    (0..count)
        .map(|index| {
            let tracker = tracker.clone();
            Arc::new(HandlerWorker::new(index, move |event: Event, _ctx| {
                let tracker = tracker.clone();
                async move {
                    let partition = event.record.key.partition;
                    {
                        let mut tracker = tracker.lock();
                        let current = {
                            let in_flight = tracker.in_flight.entry(partition).or_default();
                            *in_flight += 1;
                            *in_flight
                        };
                        let peak = tracker.peak.entry(partition).or_default();
                        *peak = (*peak).max(current);
                    }

                    tokio::time::sleep(delay).await;

                    let mut tracker = tracker.lock();
                    if let Some(in_flight) = tracker.in_flight.get_mut(&partition) {
                        *in_flight -= 1;
                    }
                    tracker.handled.entry(partition).or_default().push(event.offset());
                    Ok(Response::ok("ok"))
                }
            })) as Arc<dyn Worker>
        })
        .collect()
}

#[tokio::test]
async fn test_one_record_in_flight_per_partition() {
    init_tracing();
    let tracker = Arc::new(Mutex::new(Tracker::default()));
    let pool = pool_of(slow_workers(4, Duration::from_millis(2), tracker.clone()));
    let config: TriggerConfig = pooled().build();
    let mut harness = ClaimHarness::start(config, pool, &[0, 1], None).await;

    // interleave partitions so both are queued at once
    for offset in 0..RECORDS {
        harness.send(0, offset).await;
        harness.send(1, offset).await;
    }
    assert!(eventually(|| harness.committed(0) == Some(RECORDS) && harness.committed(1) == Some(RECORDS)).await);

    {
        let tracker = tracker.lock();
        let expected: Vec<Offset> = (0..RECORDS).collect();
        for partition in [0, 1] {
            assert_eq!(tracker.peak[&partition], 1);
            assert_eq!(tracker.handled[&partition], expected);
        }
    }

    harness.rebalance().await;
    harness.cleanup().await;
}

#[tokio::test]
async fn test_bounded_allocation_wait_is_retried() {
    let tracker = Arc::new(Mutex::new(Tracker::default()));
    let pool = pool_of(slow_workers(1, Duration::from_millis(200), tracker.clone()));
    let config = pooled().allocation_timeout(Duration::from_millis(20)).build();
    let mut harness = ClaimHarness::start(config, pool, &[0, 1], None).await;

    // the single worker is busy with one partition while the other keeps timing out
    harness.send(0, 0).await;
    harness.send(1, 0).await;

    assert!(eventually(|| harness.committed(0) == Some(1) && harness.committed(1) == Some(1)).await);
    let statistics = harness.statistics.snapshot();
    assert!(statistics.allocation_timeouts >= 1);
    assert_eq!(statistics.events_handled_success, 2);

    let results = harness.rebalance().await;
    assert!(results.iter().all(|result| result.is_ok()));
    harness.cleanup().await;
}
