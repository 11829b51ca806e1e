//! Per-API request quotas.
//!
//! Each API has a per-minute and a per-hour ceiling. Admissions are kept
//! in sliding logs, so the ceilings hold over every rolling window rather
//! than only over aligned minute/hour buckets.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::GovernorError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Configured ceilings for one API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
}

impl ApiLimits {
    pub const fn new(requests_per_minute: u32, requests_per_hour: u32) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
        }
    }
}

/// Admission log over one window span.
#[derive(Debug)]
struct SlidingWindow {
    span: Duration,
    limit: u32,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(span: Duration, limit: u32) -> Self {
        Self {
            span,
            limit,
            admitted: VecDeque::new(),
        }
    }

    /// Drop admissions that have aged out of the window.
    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.span {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&self) -> bool {
        (self.admitted.len() as u64) < u64::from(self.limit)
    }

    fn count(&self) -> u32 {
        self.admitted.len() as u32
    }
}

/// Quota state for a single API.
#[derive(Debug)]
pub struct Quota {
    name: String,
    limits: ApiLimits,
    minute: SlidingWindow,
    hour: SlidingWindow,
}

impl Quota {
    pub fn new(name: impl Into<String>, limits: ApiLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            minute: SlidingWindow::new(MINUTE, limits.requests_per_minute),
            hour: SlidingWindow::new(HOUR, limits.requests_per_hour),
        }
    }

    /// Admit one request if both windows have room.
    ///
    /// A denial leaves the counters untouched.
    pub fn try_reserve(&mut self, now: Instant) -> bool {
        self.minute.expire(now);
        self.hour.expire(now);

        if !self.minute.has_room() || !self.hour.has_room() {
            return false;
        }

        self.minute.admitted.push_back(now);
        self.hour.admitted.push_back(now);
        true
    }

    /// Current counts after expiring stale admissions.
    pub fn usage(&mut self, now: Instant) -> QuotaUsage {
        self.minute.expire(now);
        self.hour.expire(now);

        let hour_count = self.hour.count();
        let hour_utilization = if self.limits.requests_per_hour == 0 {
            100.0
        } else {
            round2(f64::from(hour_count) / f64::from(self.limits.requests_per_hour) * 100.0)
        };

        QuotaUsage {
            name: self.name.clone(),
            limits: self.limits,
            minute_count: self.minute.count(),
            hour_count,
            hour_utilization,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Point-in-time view of one API's quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub name: String,
    pub limits: ApiLimits,
    pub minute_count: u32,
    pub hour_count: u32,

    /// Hour-window usage as a percentage of the hourly ceiling
    pub hour_utilization: f64,
}

/// Quotas for every configured API.
///
/// The API set is fixed at construction, so lookups need no outer lock;
/// each quota has its own mutex.
#[derive(Debug)]
pub struct QuotaTracker {
    quotas: BTreeMap<String, Mutex<Quota>>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new<I>(apis: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = (String, ApiLimits)>,
    {
        let quotas = apis
            .into_iter()
            .map(|(name, limits)| {
                let quota = Quota::new(name.clone(), limits);
                (name, Mutex::new(quota))
            })
            .collect();

        Self { quotas, clock }
    }

    /// Whether the API is configured.
    pub fn contains(&self, api: &str) -> bool {
        self.quotas.contains_key(api)
    }

    pub fn api_names(&self) -> impl Iterator<Item = &str> {
        self.quotas.keys().map(String::as_str)
    }

    /// Atomically check and consume one request for `api`.
    pub fn try_reserve(&self, api: &str) -> Result<bool, GovernorError> {
        let quota = self
            .quotas
            .get(api)
            .ok_or_else(|| GovernorError::UnknownApi(api.to_string()))?;

        let now = self.clock.now();
        Ok(quota.lock().try_reserve(now))
    }

    /// Usage of a single API.
    pub fn usage(&self, api: &str) -> Result<QuotaUsage, GovernorError> {
        let quota = self
            .quotas
            .get(api)
            .ok_or_else(|| GovernorError::UnknownApi(api.to_string()))?;

        let now = self.clock.now();
        Ok(quota.lock().usage(now))
    }

    /// Usage of every API, ordered by name.
    pub fn usage_all(&self) -> Vec<QuotaUsage> {
        let now = self.clock.now();
        self.quotas
            .values()
            .map(|quota| quota.lock().usage(now))
            .collect()
    }
}
