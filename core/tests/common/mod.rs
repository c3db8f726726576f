#![allow(dead_code)]

use fluxmq_trigger::broker::{Claim, ConsumerGroupHandler};
use fluxmq_trigger::event::PartitionKey;
use fluxmq_trigger::memory::MemorySession;
use fluxmq_trigger::metrics::TriggerStatistics;
use fluxmq_trigger::trigger::{ConsumptionSession, FatalHook};
use fluxmq_trigger::worker::{FixedWorkerPool, Worker, WorkerPool};
use fluxmq_trigger::{Record, Result, TriggerConfig, TriggerError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const STREAM: &str = "orders";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pool_of(workers: Vec<Arc<dyn Worker>>) -> Arc<dyn WorkerPool> {
    Arc::new(FixedWorkerPool::new(workers).unwrap())
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Fatal hook that records instead of aborting
pub fn recording_hook() -> (FatalHook, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let hook: FatalHook = {
        let errors = errors.clone();
        Arc::new(move |err: &TriggerError| errors.lock().push(err.to_string()))
    };
    (hook, errors)
}

/// One generation with claims consumed by a live [`ConsumptionSession`]
pub struct ClaimHarness {
    pub session: Arc<MemorySession>,
    pub handler: Arc<ConsumptionSession>,
    pub statistics: Arc<TriggerStatistics>,
    pub records: BTreeMap<i32, mpsc::Sender<Record>>,
    pub tasks: BTreeMap<i32, JoinHandle<Result<()>>>,
}

impl ClaimHarness {
    pub async fn start(
        config: TriggerConfig,
        pool: Arc<dyn WorkerPool>,
        partitions: &[i32],
        hook: Option<FatalHook>,
    ) -> Self {
        let statistics = Arc::new(TriggerStatistics::default());
        let mut handler = ConsumptionSession::new(Arc::new(config), pool, statistics.clone());
        if let Some(hook) = hook {
            handler = handler.with_fatal_hook(hook);
        }
        let handler = Arc::new(handler);

        let claims = BTreeMap::from([(STREAM.to_string(), partitions.to_vec())]);
        let session = Arc::new(MemorySession::new("member-1", 1, claims));
        handler.setup(session.clone()).await.unwrap();

        let mut records = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for partition in partitions {
            let (tx, rx) = mpsc::channel(16);
            let claim = Claim::new(PartitionKey::new(STREAM, *partition), 0, rx);
            let task = spawn_claim(handler.clone(), session.clone(), claim);
            records.insert(*partition, tx);
            tasks.insert(*partition, task);
        }

        Self {
            session,
            handler,
            statistics,
            records,
            tasks,
        }
    }

    pub async fn send(&self, partition: i32, offset: i64) {
        let record = Record::new(PartitionKey::new(STREAM, partition), offset, "payload");
        self.records[&partition].send(record).await.unwrap();
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.session.committed(STREAM, partition)
    }

    /// Rebalance, then wait for every claim to return
    pub async fn rebalance(&mut self) -> Vec<Result<()>> {
        self.session.cancel();

        let mut results = Vec::new();
        for (_, task) in std::mem::take(&mut self.tasks) {
            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("claim did not return after rebalance")
                .unwrap();
            results.push(result);
        }
        results
    }

    pub async fn cleanup(&self) {
        self.handler.cleanup(self.session.clone()).await.unwrap();
    }
}

fn spawn_claim(
    handler: Arc<ConsumptionSession>,
    session: Arc<MemorySession>,
    claim: Claim,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { handler.consume_claim(session, claim).await })
}

/// Handler that never finishes
pub fn never_completes() -> impl Future<Output = Result<fluxmq_trigger::Response>> + Send {
    async {
        futures::future::pending::<()>().await;
        Ok(fluxmq_trigger::Response::ok("unreachable"))
    }
}
