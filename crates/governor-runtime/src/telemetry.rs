//! Periodic metrics publication.
//!
//! The emitter runs as its own task and only reads shared counters, so a
//! slow sink never holds up the processor.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use governor_core::MetricsSnapshot;

use crate::governor::Governor;

/// Errors from publishing a snapshot.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write metrics: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for metrics snapshots.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<(), SinkError>;
}

/// Rewrites a JSON file with the latest snapshot.
///
/// The file is written next to the target and renamed into place, so a
/// reader never sees a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonFileSink {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        let json = snapshot.to_json_pretty()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Logs a one-line summary of each snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        tracing::info!(
            success_rate = %format!("{:.2}%", snapshot.success_rate * 100.0),
            error_burst_index = %format!("{:.2}", snapshot.error_burst_index),
            active_cascades = snapshot.cascades.active,
            queued_cascades = snapshot.cascades.waiting,
            open_breakers = snapshot.circuit_breakers.open,
            paused = snapshot.processing_paused,
            "Telemetry"
        );
        Ok(())
    }
}

/// Publishes a snapshot to every sink on a fixed interval.
pub struct TelemetryEmitter {
    governor: Governor,
    sinks: Vec<Arc<dyn MetricsSink>>,
    interval: Duration,
}

impl TelemetryEmitter {
    pub fn new(governor: Governor, sinks: Vec<Arc<dyn MetricsSink>>, interval: Duration) -> Self {
        Self {
            governor,
            sinks,
            interval,
        }
    }

    /// Tick until shutdown, then publish one final snapshot.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.emit_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.emit_once().await;
    }

    /// Compute a snapshot and publish it to all sinks concurrently.
    ///
    /// A failing sink is logged and skipped.
    pub async fn emit_once(&self) -> MetricsSnapshot {
        let snapshot = self.governor.snapshot();

        let results = join_all(self.sinks.iter().map(|sink| sink.publish(&snapshot))).await;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(sink = sink.name(), error = %e, "Failed to publish metrics");
            }
        }

        snapshot
    }
}
