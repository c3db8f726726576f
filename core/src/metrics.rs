//! Statistics collection for stream triggers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trigger statistics collector
#[derive(Debug, Default)]
pub struct TriggerStatistics {
    // Event metrics
    pub events_handled_success: AtomicU64,
    pub events_handled_failure: AtomicU64,
    pub handle_latency_sum: AtomicU64,
    pub handle_latency_count: AtomicU64,
    pub allocation_timeouts: AtomicU64,

    // Commit metrics
    pub offsets_marked: AtomicU64,
    pub explicit_acks_applied: AtomicU64,
    pub explicit_acks_ignored: AtomicU64,

    // Rebalance metrics
    pub sessions_started: AtomicU64,
    pub drain_timeouts: AtomicU64,
    pub worker_restarts: AtomicU64,

    // Connection metrics
    pub connection_failures: AtomicU64,
    pub resume_failures: AtomicU64,
}

impl TriggerStatistics {
    /// Record a handler invocation
    pub fn record_event(&self, success: bool, latency: Duration) {
        if success {
            self.events_handled_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_handled_failure.fetch_add(1, Ordering::Relaxed);
        }
        self.handle_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.handle_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_timeout(&self) {
        self.allocation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offset_marked(&self) {
        self.offsets_marked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_ack(&self, applied: bool) {
        if applied {
            self.explicit_acks_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.explicit_acks_ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain_timeout(&self) {
        self.drain_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resume_failure(&self) {
        self.resume_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average handler latency in microseconds
    pub fn average_handle_latency_us(&self) -> f64 {
        let sum = self.handle_latency_sum.load(Ordering::Relaxed);
        let count = self.handle_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            events_handled_success: self.events_handled_success.load(Ordering::Relaxed),
            events_handled_failure: self.events_handled_failure.load(Ordering::Relaxed),
            average_handle_latency_us: self.average_handle_latency_us(),
            allocation_timeouts: self.allocation_timeouts.load(Ordering::Relaxed),
            offsets_marked: self.offsets_marked.load(Ordering::Relaxed),
            explicit_acks_applied: self.explicit_acks_applied.load(Ordering::Relaxed),
            explicit_acks_ignored: self.explicit_acks_ignored.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            drain_timeouts: self.drain_timeouts.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            resume_failures: self.resume_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatisticsSnapshot {
    pub events_handled_success: u64,
    pub events_handled_failure: u64,
    pub average_handle_latency_us: f64,
    pub allocation_timeouts: u64,
    pub offsets_marked: u64,
    pub explicit_acks_applied: u64,
    pub explicit_acks_ignored: u64,
    pub sessions_started: u64,
    pub drain_timeouts: u64,
    pub worker_restarts: u64,
    pub connection_failures: u64,
    pub resume_failures: u64,
}

/// Process-wide statistics, for triggers that report into one place
static GLOBAL_STATISTICS: once_cell::sync::Lazy<Arc<TriggerStatistics>> =
    once_cell::sync::Lazy::new(|| Arc::new(TriggerStatistics::default()));

/// Get the global statistics instance
pub fn global_statistics() -> Arc<TriggerStatistics> {
    GLOBAL_STATISTICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = TriggerStatistics::default();
        stats.record_event(true, Duration::from_micros(100));
        stats.record_event(false, Duration::from_micros(300));
        stats.record_explicit_ack(true);
        stats.record_explicit_ack(false);
        stats.record_drain_timeout();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_handled_success, 1);
        assert_eq!(snapshot.events_handled_failure, 1);
        assert_eq!(snapshot.average_handle_latency_us, 200.0);
        assert_eq!(snapshot.explicit_acks_applied, 1);
        assert_eq!(snapshot.explicit_acks_ignored, 1);
        assert_eq!(snapshot.drain_timeouts, 1);
        assert_eq!(snapshot.worker_restarts, 0);
    }

    #[test]
    fn test_global_statistics_is_shared() {
        let first = global_statistics();
        let second = global_statistics();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
