//! Publish/subscribe channel between a function runtime and its trigger
//!
//! A function emits control messages (today only explicit acks) on the control
//! channel of the worker it runs on. Triggers subscribe per claim and receive every
//! message of the subscribed kind; filtering by partition is left to the subscriber.

use crate::event::{ControlMessage, ControlMessageKind};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub type SubscriptionId = u64;

#[derive(Debug)]
struct Subscription {
    kind: ControlMessageKind,
    tx: mpsc::UnboundedSender<ControlMessage>,
}

/// Fan-out control message channel
#[derive(Debug, Default)]
pub struct ControlChannel {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every message of `kind`
    pub fn subscribe(
        &self,
        kind: ControlMessageKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe_sender(kind, tx), rx)
    }

    /// Subscribe an existing sender, so one receiver can listen to many channels
    pub fn subscribe_sender(
        &self,
        kind: ControlMessageKind,
        tx: mpsc::UnboundedSender<ControlMessage>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, Subscription { kind, tx });
        debug!("Control subscription {} added for {:?}", id, kind);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscriptions.remove(&id).is_some() {
            debug!("Control subscription {} removed", id);
        }
    }

    /// Deliver a message to every subscriber of its kind; returns how many received it
    pub fn publish(&self, message: ControlMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscriptions.iter() {
            if entry.kind != message.kind {
                continue;
            }
            if entry.tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.subscriptions.remove(&id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}
