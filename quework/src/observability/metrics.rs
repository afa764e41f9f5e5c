use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::Resolution;

/// Counters shared by every worker in a pool
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    jobs_claimed: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_rescheduled: AtomicU64,
    store_errors: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claimed(&self) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution(&self, resolution: &Resolution) {
        let counter = match resolution {
            Resolution::Delete => &self.jobs_completed,
            Resolution::Retry { .. } => &self.jobs_retried,
            Resolution::Reschedule { .. } => &self.jobs_rescheduled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_rescheduled: self.jobs_rescheduled.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_rescheduled: u64,
    pub store_errors: u64,
}

impl MetricsSnapshot {
    /// Claims that ended in any resolution
    pub fn jobs_resolved(&self) -> u64 {
        self.jobs_completed + self.jobs_retried + self.jobs_rescheduled
    }
}
