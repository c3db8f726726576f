//! Error types for the FluxMQ trigger engine

use crate::event::PartitionId;

/// Main error type for trigger operations
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Invalid or inconsistent configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// No worker became free within the allocation timeout
    #[error("No available workers")]
    NoAvailableWorkers,

    /// The static allocator was asked for a partition it was not built with
    #[error("No worker assigned to stream/partition ({stream}/{partition})")]
    NoWorkerAssigned { stream: String, partition: PartitionId },

    /// A release was attempted with a cookie the allocator did not issue
    #[error("Invalid allocation cookie: {message}")]
    InvalidCookie { message: String },

    /// The function handler failed to process an event
    #[error("Processing error: {message}")]
    Processing { message: String },

    /// An in-flight handler did not finish within the rebalance drain window
    #[error("Handler did not complete within {timeout_ms}ms of a rebalance")]
    DrainTimeout { timeout_ms: u64 },

    /// The worker cannot cancel its in-flight invocation
    #[error("Worker {index} does not support restart")]
    RestartUnsupported { index: usize },

    /// Worker lifecycle errors (restart, drain, resume)
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Broker connectivity errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Consumer group errors (join, session, claim)
    #[error("Consumer group error: {message}")]
    ConsumerGroup { message: String },

    /// Unrecoverable condition, reported through the fatal hook
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// The component was already stopped or closed
    #[error("Closed")]
    Closed,

    /// JSON conversion errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TriggerError {
    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new invalid cookie error
    pub fn invalid_cookie<S: Into<String>>(message: S) -> Self {
        Self::InvalidCookie {
            message: message.into(),
        }
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(message: S) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    /// Create a new worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new consumer group error
    pub fn consumer_group<S: Into<String>>(message: S) -> Self {
        Self::ConsumerGroup {
            message: message.into(),
        }
    }

    /// Create a new fatal error
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Check if the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableWorkers | Self::Connection { .. } | Self::ConsumerGroup { .. }
        )
    }

    /// Check if this is the allocation-timeout outcome
    pub fn is_no_available_workers(&self) -> bool {
        matches!(self, Self::NoAvailableWorkers)
    }

    /// Check if this error must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
