use super::OffsetMarker;
use crate::commit::CommitPolicy;
use crate::control::{ControlChannel, SubscriptionId};
use crate::event::{ControlMessage, ControlMessageKind, PartitionKey};
use crate::metrics::TriggerStatistics;
use crate::worker::Worker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Applies explicit acks published by the function to one partition's commit offset.
///
/// Listens on the control channel of every worker in the pool, since the ack for a
/// record may come from whichever worker processed it. Acks for other partitions are
/// dropped.
pub struct ExplicitAckHandler {
    key: PartitionKey,
    subscriptions: Vec<(Arc<ControlChannel>, SubscriptionId)>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ExplicitAckHandler {
    pub(crate) fn start(
        key: PartitionKey,
        workers: &[Arc<dyn Worker>],
        policy: CommitPolicy,
        marker: Arc<OffsetMarker>,
        statistics: Arc<TriggerStatistics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let subscriptions: Vec<_> = workers
            .iter()
            .filter_map(|worker| worker.control_channel())
            .map(|channel| {
                let id = channel.subscribe_sender(ControlMessageKind::StreamMessageAck, tx.clone());
                (channel, id)
            })
            .collect();

        if subscriptions.is_empty() {
            warn!("No worker exposes a control channel, explicit acks for {} will never arrive", key);
        }

        let stop = CancellationToken::new();
        let listener = AckListener {
            key: key.clone(),
            policy,
            marker,
            statistics,
        };
        let task = tokio::spawn(listener.run(rx, stop.clone()));

        debug!("Explicit ack handler started for {}", key);

        Self {
            key,
            subscriptions,
            stop,
            task,
        }
    }

    /// Unsubscribe, apply whatever acks already arrived and wait for the task
    pub async fn stop(self) {
        for (channel, id) in &self.subscriptions {
            channel.unsubscribe(*id);
        }
        self.stop.cancel();

        if let Err(e) = self.task.await {
            warn!("Explicit ack handler for {} failed: {}", self.key, e);
        }
        debug!("Explicit ack handler stopped for {}", self.key);
    }
}

struct AckListener {
    key: PartitionKey,
    policy: CommitPolicy,
    marker: Arc<OffsetMarker>,
    statistics: Arc<TriggerStatistics>,
}

impl AckListener {
    async fn run(self, mut acks: mpsc::UnboundedReceiver<ControlMessage>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                message = acks.recv() => match message {
                    Some(message) => self.apply(message),
                    None => return,
                },
            }
        }

        while let Ok(message) = acks.try_recv() {
            self.apply(message);
        }
    }

    fn apply(&self, message: ControlMessage) {
        if message.key != self.key {
            self.statistics.record_explicit_ack(false);
            return;
        }

        let Some(offset) = self.policy.offset_for_ack(message.offset) else {
            self.statistics.record_explicit_ack(false);
            return;
        };

        match self.marker.mark(offset) {
            Ok(marked) => {
                debug!(
                    "Explicit ack for {} offset {} applied (marked: {})",
                    self.key, message.offset, marked
                );
                self.statistics.record_explicit_ack(true);
            }
            Err(e) => warn!(
                "Failed to mark explicitly acked offset {} on {}: {}",
                message.offset, self.key, e
            ),
        }
    }
}
