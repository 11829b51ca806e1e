//! Process-wide governor counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the admission path, the processor and
/// telemetry.
#[derive(Debug, Default)]
pub struct Counters {
    requests_approved: AtomicU64,
    circuit_breaker_blocks: AtomicU64,
    rate_limit_blocks: AtomicU64,
    cascade_successes: AtomicU64,
    cascade_failures: AtomicU64,
    error_bursts: AtomicU64,
    cascades_queued: AtomicU64,
    cascades_started: AtomicU64,
    cascades_completed: AtomicU64,
    cascades_failed: AtomicU64,
    cascades_requeued: AtomicU64,
    peak_active_cascades: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approved(&self) {
        self.requests_approved.fetch_add(1, Ordering::SeqCst);
    }

    pub fn circuit_blocked(&self) {
        self.circuit_breaker_blocks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn rate_limited(&self) {
        self.rate_limit_blocks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn result_success(&self) {
        self.cascade_successes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn result_failure(&self) {
        self.cascade_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn error_burst(&self) {
        self.error_bursts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cascade_queued(&self) {
        self.cascades_queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a started cascade and remember the highest concurrency seen.
    pub fn cascade_started(&self, active_now: usize) {
        self.cascades_started.fetch_add(1, Ordering::SeqCst);
        self.peak_active_cascades
            .fetch_max(active_now as u64, Ordering::SeqCst);
    }

    pub fn cascade_completed(&self) {
        self.cascades_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cascade_failed(&self) {
        self.cascades_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cascade_requeued(&self) {
        self.cascades_requeued.fetch_add(1, Ordering::SeqCst);
    }

    /// Result reports seen so far as (successes, failures).
    pub fn results(&self) -> (u64, u64) {
        (
            self.cascade_successes.load(Ordering::SeqCst),
            self.cascade_failures.load(Ordering::SeqCst),
        )
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests_approved: self.requests_approved.load(Ordering::SeqCst),
            circuit_breaker_blocks: self.circuit_breaker_blocks.load(Ordering::SeqCst),
            rate_limit_blocks: self.rate_limit_blocks.load(Ordering::SeqCst),
            cascade_successes: self.cascade_successes.load(Ordering::SeqCst),
            cascade_failures: self.cascade_failures.load(Ordering::SeqCst),
            error_bursts: self.error_bursts.load(Ordering::SeqCst),
            cascades_queued: self.cascades_queued.load(Ordering::SeqCst),
            cascades_started: self.cascades_started.load(Ordering::SeqCst),
            cascades_completed: self.cascades_completed.load(Ordering::SeqCst),
            cascades_failed: self.cascades_failed.load(Ordering::SeqCst),
            cascades_requeued: self.cascades_requeued.load(Ordering::SeqCst),
            peak_active_cascades: self.peak_active_cascades.load(Ordering::SeqCst),
        }
    }
}

/// Plain copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub requests_approved: u64,
    pub circuit_breaker_blocks: u64,
    pub rate_limit_blocks: u64,
    pub cascade_successes: u64,
    pub cascade_failures: u64,
    pub error_bursts: u64,
    pub cascades_queued: u64,
    pub cascades_started: u64,
    pub cascades_completed: u64,
    pub cascades_failed: u64,
    pub cascades_requeued: u64,
    pub peak_active_cascades: u64,
}

impl CounterSnapshot {
    /// Total result reports.
    pub fn results_total(&self) -> u64 {
        self.cascade_successes + self.cascade_failures
    }
}
