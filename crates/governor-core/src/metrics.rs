//! Point-in-time metrics aggregated from the governor's counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::circuit_breaker::BreakerCounts;
use crate::counters::CounterSnapshot;
use crate::quota::QuotaUsage;

/// Cascade lifecycle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeCounts {
    pub queued_total: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub active: usize,
    pub waiting: usize,
    pub peak_active: u64,

    /// Finished cascades whose outcome is still retained for polling
    #[serde(default)]
    pub retained: u64,
}

impl CascadeCounts {
    pub fn from_counters(counters: &CounterSnapshot, active: usize, waiting: usize) -> Self {
        Self {
            queued_total: counters.cascades_queued,
            started: counters.cascades_started,
            completed: counters.cascades_completed,
            failed: counters.cascades_failed,
            requeued: counters.cascades_requeued,
            active,
            waiting,
            peak_active: counters.peak_active_cascades,
            retained: 0,
        }
    }
}

/// Snapshot published on every telemetry tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_approved: u64,
    pub circuit_breaker_blocks: u64,
    pub rate_limit_blocks: u64,
    pub cascade_successes: u64,
    pub cascade_failures: u64,

    /// successes / (successes + failures), 0 before any report
    pub success_rate: f64,

    pub error_bursts: u64,

    /// Error bursts per 100 result reports
    pub error_burst_index: f64,

    /// Hour-window utilisation percentage per API
    pub api_utilization: BTreeMap<String, f64>,

    pub circuit_breakers: BreakerCounts,
    pub cascades: CascadeCounts,
    pub processing_paused: bool,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn compute(
        counters: &CounterSnapshot,
        quotas: &[QuotaUsage],
        circuit_breakers: BreakerCounts,
        cascades: CascadeCounts,
        processing_paused: bool,
    ) -> Self {
        let total = counters.results_total();
        let (success_rate, error_burst_index) = if total > 0 {
            (
                counters.cascade_successes as f64 / total as f64,
                counters.error_bursts as f64 / total as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        let api_utilization = quotas
            .iter()
            .map(|usage| (usage.name.clone(), usage.hour_utilization))
            .collect();

        Self {
            requests_approved: counters.requests_approved,
            circuit_breaker_blocks: counters.circuit_breaker_blocks,
            rate_limit_blocks: counters.rate_limit_blocks,
            cascade_successes: counters.cascade_successes,
            cascade_failures: counters.cascade_failures,
            success_rate,
            error_bursts: counters.error_bursts,
            error_burst_index,
            api_utilization,
            circuit_breakers,
            cascades,
            processing_paused,
            timestamp: Utc::now(),
        }
    }

    /// Pretty JSON with an RFC 3339 timestamp.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
