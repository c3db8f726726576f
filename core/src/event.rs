//! Records, events and control messages flowing through a trigger

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

pub type StreamName = String;
pub type PartitionId = i32;
pub type Offset = i64;

/// Opaque position a trigger can be restarted from
pub type Checkpoint = String;

/// Response header through which a function defers acknowledgment
pub const NO_ACK_HEADER: &str = "x-fluxmq-stream-no-ack";

/// Identifies one ordered record sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub stream: StreamName,
    pub partition: PartitionId,
}

impl PartitionKey {
    pub fn new<S: Into<StreamName>>(stream: S, partition: PartitionId) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.partition)
    }
}

/// A record read from a claimed partition
#[derive(Debug, Clone)]
pub struct Record {
    pub key: PartitionKey,
    pub offset: Offset,
    pub payload: Bytes,
    pub headers: HashMap<String, Bytes>,
    pub timestamp: u64,
}

impl Record {
    pub fn new<V: Into<Bytes>>(key: PartitionKey, offset: Offset, payload: V) -> Self {
        Self {
            key,
            offset,
            payload: payload.into(),
            headers: HashMap::new(),
            timestamp: now_millis(),
        }
    }

    pub fn with_header<K: Into<String>, V: Into<Bytes>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn stream(&self) -> &str {
        &self.key.stream
    }

    pub fn partition(&self) -> PartitionId {
        self.key.partition
    }
}

/// A record as handed to a function, tagged with the trigger that produced it
#[derive(Debug, Clone)]
pub struct Event {
    pub record: Record,
    pub trigger_kind: String,
    pub trigger_name: String,
}

impl Event {
    pub fn new(record: Record, trigger_kind: &str, trigger_name: &str) -> Self {
        Self {
            record,
            trigger_kind: trigger_kind.to_string(),
            trigger_name: trigger_name.to_string(),
        }
    }

    pub fn offset(&self) -> Offset {
        self.record.offset
    }

    pub fn body(&self) -> &Bytes {
        &self.record.payload
    }
}

/// Function response
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status_code: u16,
    pub body: Bytes,
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn ok<B: Into<Bytes>>(body: B) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// Ask the trigger not to commit this event; an explicit ack will follow
    pub fn ensure_no_ack(mut self) -> Self {
        self.headers
            .insert(NO_ACK_HEADER.to_string(), "true".to_string());
        self
    }

    pub fn is_no_ack(&self) -> bool {
        self.headers
            .get(NO_ACK_HEADER)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Kinds of messages carried on a worker control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMessageKind {
    StreamMessageAck,
}

/// Out-of-band message emitted by the function runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub kind: ControlMessageKind,
    pub key: PartitionKey,
    pub offset: Offset,
}

impl ControlMessage {
    pub fn ack(key: PartitionKey, offset: Offset) -> Self {
        Self {
            kind: ControlMessageKind::StreamMessageAck,
            key,
            offset,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
