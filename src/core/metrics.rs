use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retries: u64,
    pub pending_requests: u64,
    pub queued_requests: u64,
    pub uptime_seconds: f64,
    pub requests_per_second: f64,
    pub success_rate: f64,
}

#[derive(Clone, Debug)]
pub(crate) struct ClientMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    started_at: Instant,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl ClientMetrics {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                total: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Combines the monotonic counters with live engine gauges into a
    /// point-in-time snapshot with derived rates.
    pub(crate) fn snapshot(&self, pending: u64, queued: u64) -> MetricsSnapshot {
        let total = self.inner.total.load(Ordering::Relaxed);
        let succeeded = self.inner.succeeded.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);
        let retries = self.inner.retries.load(Ordering::Relaxed);
        let uptime_seconds = self.inner.started_at.elapsed().as_secs_f64();

        let requests_per_second = if uptime_seconds > 0.0 {
            total as f64 / uptime_seconds
        } else {
            0.0
        };
        let success_rate = if total > 0 {
            succeeded as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests: total,
            successful_requests: succeeded,
            failed_requests: failed,
            retries,
            pending_requests: pending,
            queued_requests: queued,
            uptime_seconds,
            requests_per_second,
            success_rate,
        }
    }
}
