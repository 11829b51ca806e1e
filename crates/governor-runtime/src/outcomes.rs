//! Retained outcomes of finished cascades.
//!
//! Finished cascades are dropped from the live set; their final status is
//! kept here for a bounded time so submitters can poll for it.

use governor_core::{CascadeId, CascadeStatus};
use moka::future::Cache;
use std::time::Duration;

/// Bounded, expiring store of terminal cascade statuses.
pub struct OutcomeStore {
    cache: Cache<CascadeId, CascadeStatus>,
}

impl OutcomeStore {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, id: &CascadeId) -> Option<CascadeStatus> {
        self.cache.get(id).await
    }

    pub async fn insert(&self, id: CascadeId, status: CascadeStatus) {
        self.cache.insert(id, status).await;
    }

    /// Approximate number of retained outcomes.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for OutcomeStore {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(600))
    }
}

impl std::fmt::Debug for OutcomeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
