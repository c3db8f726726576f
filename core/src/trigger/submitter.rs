use crate::commit::{CommitPolicy, Completion};
use crate::event::{Event, PartitionKey};
use crate::metrics::TriggerStatistics;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A record handed to the submitter together with the worker allocated for it
pub(crate) struct Submission {
    pub(crate) event: Event,
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) done: oneshot::Sender<Completion>,
}

/// Runs the invocations of one partition, one at a time
pub struct EventSubmitter {
    key: PartitionKey,
    policy: CommitPolicy,
    statistics: Arc<TriggerStatistics>,
}

impl EventSubmitter {
    pub fn new(key: PartitionKey, policy: CommitPolicy, statistics: Arc<TriggerStatistics>) -> Self {
        Self {
            key,
            policy,
            statistics,
        }
    }

    /// Submit until the sending side closes
    pub(crate) async fn run(self, mut submissions: mpsc::Receiver<Submission>) {
        debug!("Event submitter started for {}", self.key);

        while let Some(submission) = submissions.recv().await {
            let offset = submission.event.offset();
            let started = Instant::now();

            let result = submission.worker.invoke(submission.event).await;
            if let Err(e) = &result {
                debug!("Process error on {} offset {}: {}", self.key, offset, e);
            }
            self.statistics
                .record_event(result.is_ok(), started.elapsed());

            // the consumer may have stopped waiting during a drain
            let _ = submission.done.send(self.policy.classify(result));
        }

        debug!("Event submitter stopped for {}", self.key);
    }
}
