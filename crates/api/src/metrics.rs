use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct Metrics {
    // Counters
    total_requests: AtomicUsize,
    successful_requests: AtomicUsize,
    failed_requests: AtomicUsize,

    // Timing (in microseconds)
    total_request_time_us: AtomicU64,

    // Pipeline events
    sessions_created: AtomicUsize,
    reviews_recorded: AtomicUsize,
    messages_posted: AtomicUsize,
    sessions_persisted: AtomicUsize,
    changes_queued: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_requests: AtomicUsize::new(0),
            successful_requests: AtomicUsize::new(0),
            failed_requests: AtomicUsize::new(0),
            total_request_time_us: AtomicU64::new(0),
            sessions_created: AtomicUsize::new(0),
            reviews_recorded: AtomicUsize::new(0),
            messages_posted: AtomicUsize::new(0),
            sessions_persisted: AtomicUsize::new(0),
            changes_queued: AtomicUsize::new(0),
        })
    }

    pub fn record_request(&self, success: bool, duration: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_request_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_review(&self) {
        self.reviews_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, changes: usize) {
        self.sessions_persisted.fetch_add(1, Ordering::Relaxed);
        self.changes_queued.fetch_add(changes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_us = self.total_request_time_us.load(Ordering::Relaxed) as f64;
        MetricsSnapshot {
            total_requests,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            avg_request_time_ms: if total_requests > 0 {
                total_us / total_requests as f64 / 1000.0
            } else {
                0.0
            },
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            reviews_recorded: self.reviews_recorded.load(Ordering::Relaxed),
            messages_posted: self.messages_posted.load(Ordering::Relaxed),
            sessions_persisted: self.sessions_persisted.load(Ordering::Relaxed),
            changes_queued: self.changes_queued.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub avg_request_time_ms: f64,
    pub sessions_created: usize,
    pub reviews_recorded: usize,
    pub messages_posted: usize,
    pub sessions_persisted: usize,
    pub changes_queued: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
