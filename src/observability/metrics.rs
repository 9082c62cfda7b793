//! Lock-free counters for sessions and accounting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::session::{FailureReason, SessionOutcome};

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram; values are recorded in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn session_duration() -> Self {
        Self::new(vec![
            100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 30_000.0, 60_000.0, 300_000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum.load(Ordering::Relaxed) as f64 / n as f64,
        }
    }
}

/// Process-wide gateway counters, shared by the engine and the pipeline.
#[derive(Debug)]
pub struct GatewayMetrics {
    pub sessions_started: Counter,
    pub sessions_completed: Counter,
    pub sessions_partial: Counter,
    pub sessions_failed: Counter,
    pub sessions_timed_out: Counter,
    pub sessions_active: Gauge,
    pub session_duration_ms: Histogram,
    pub raw_tokens: Counter,

    pub accounting_enqueued: Counter,
    pub accounting_dropped: Counter,
    pub accounting_applied: Counter,
    pub accounting_duplicate: Counter,
    pub accounting_abandoned: Counter,
    pub accounting_queue_depth: Gauge,
    pub accounting_queue_capacity: Gauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            sessions_started: Counter::new(),
            sessions_completed: Counter::new(),
            sessions_partial: Counter::new(),
            sessions_failed: Counter::new(),
            sessions_timed_out: Counter::new(),
            sessions_active: Gauge::new(),
            session_duration_ms: Histogram::session_duration(),
            raw_tokens: Counter::new(),
            accounting_enqueued: Counter::new(),
            accounting_dropped: Counter::new(),
            accounting_applied: Counter::new(),
            accounting_duplicate: Counter::new(),
            accounting_abandoned: Counter::new(),
            accounting_queue_depth: Gauge::new(),
            accounting_queue_capacity: Gauge::new(),
        }
    }

    pub fn record_session_start(&self) {
        self.sessions_started.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_end(
        &self,
        outcome: SessionOutcome,
        failure: Option<&FailureReason>,
        raw_tokens: u64,
        duration_ms: f64,
    ) {
        self.sessions_active.dec();
        self.session_duration_ms.observe(duration_ms);
        self.raw_tokens.add(raw_tokens);
        match outcome {
            SessionOutcome::Success => self.sessions_completed.inc(),
            SessionOutcome::PartialSuccess => self.sessions_partial.inc(),
            SessionOutcome::Failure => {
                self.sessions_failed.inc();
                if matches!(failure, Some(FailureReason::Timeout)) {
                    self.sessions_timed_out.inc();
                }
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.get(),
            sessions_completed: self.sessions_completed.get(),
            sessions_partial: self.sessions_partial.get(),
            sessions_failed: self.sessions_failed.get(),
            sessions_timed_out: self.sessions_timed_out.get(),
            sessions_active: self.sessions_active.get(),
            mean_session_ms: self.session_duration_ms.mean(),
            raw_tokens: self.raw_tokens.get(),
            accounting_enqueued: self.accounting_enqueued.get(),
            dropped_requests_total: self.accounting_dropped.get(),
            accounting_applied: self.accounting_applied.get(),
            accounting_duplicate: self.accounting_duplicate.get(),
            accounting_abandoned: self.accounting_abandoned.get(),
            queue_size: self.accounting_queue_depth.get(),
            queue_capacity: self.accounting_queue_capacity.get(),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_partial: u64,
    pub sessions_failed: u64,
    pub sessions_timed_out: u64,
    pub sessions_active: i64,
    pub mean_session_ms: f64,
    pub raw_tokens: u64,
    pub accounting_enqueued: u64,
    pub dropped_requests_total: u64,
    pub accounting_applied: u64,
    pub accounting_duplicate: u64,
    pub accounting_abandoned: u64,
    pub queue_size: i64,
    pub queue_capacity: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_mean() {
        let hist = Histogram::new(vec![10.0, 100.0]);
        assert_eq!(hist.mean(), 0.0);
        hist.observe(5.0);
        hist.observe(15.0);
        hist.observe(1_000.0);
        assert_eq!(hist.count(), 3);
        assert!((hist.mean() - 340.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_session_outcomes_tallied() {
        let metrics = GatewayMetrics::new();
        for _ in 0..3 {
            metrics.record_session_start();
        }
        metrics.record_session_end(SessionOutcome::Success, None, 100, 20.0);
        metrics.record_session_end(SessionOutcome::PartialSuccess, None, 50, 20.0);
        metrics.record_session_end(
            SessionOutcome::Failure,
            Some(&FailureReason::Timeout),
            0,
            20.0,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 3);
        assert_eq!(snapshot.sessions_active, 0);
        assert_eq!(snapshot.sessions_partial, 1);
        assert_eq!(snapshot.sessions_timed_out, 1);
        assert_eq!(snapshot.raw_tokens, 150);
    }
}
