//! End-to-end tests of the processor loop against real (short) timers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use governor_core::{
    ApiLimits, Cascade, CascadeId, CascadeSpec, CascadeStatus, ClientConfig, GovernorConfig,
};
use governor_runtime::{
    Governor, GovernorClient, JsonFileSink, StepError, StepExecutor,
};

/// Records every call; fails any (cascade name, api) listed in `failing`.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
    failing: HashSet<(String, String)>,
}

impl RecordingExecutor {
    fn failing(pairs: &[(&str, &str)]) -> Self {
        Self {
            failing: pairs
                .iter()
                .map(|(c, a)| (c.to_string(), a.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(&self, cascade: &Cascade, api: &str) -> Result<(), StepError> {
        let key = (cascade.spec.name.clone(), api.to_string());
        self.calls.lock().push(key.clone());
        if self.failing.contains(&key) {
            return Err(StepError::failed(api, "upstream returned 500"));
        }
        Ok(())
    }
}

/// Blocks every step until a permit is released.
struct GatedExecutor {
    gate: Semaphore,
}

#[async_trait]
impl StepExecutor for GatedExecutor {
    async fn execute(&self, _cascade: &Cascade, _api: &str) -> Result<(), StepError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StepError::Internal(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

/// Panics on every step of a cascade named `bad`.
struct PanickingExecutor;

#[async_trait]
impl StepExecutor for PanickingExecutor {
    async fn execute(&self, cascade: &Cascade, api: &str) -> Result<(), StepError> {
        if cascade.spec.name == "bad" {
            panic!("executor bug while calling {}", api);
        }
        Ok(())
    }
}

fn fast_config() -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.processor.poll_interval = Duration::from_millis(10);
    config.processor.pause_backoff = Duration::from_millis(20);
    config.telemetry.interval = Duration::from_secs(3600);
    config
}

async fn wait_for<F>(governor: &Governor, id: &CascadeId, done: F) -> CascadeStatus
where
    F: Fn(&CascadeStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = governor.status(id).await {
                if done(&status) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("cascade {} never reached expected state", id))
}

async fn wait_terminal(governor: &Governor, id: &CascadeId) -> CascadeStatus {
    wait_for(governor, id, CascadeStatus::is_terminal).await
}

#[tokio::test]
async fn test_cascade_steps_run_in_declaration_order() {
    let executor = Arc::new(RecordingExecutor::default());
    let governor = Governor::new(fast_config(), executor.clone());
    let handle = governor.start();

    let id = governor
        .submit(CascadeSpec::new("grant_sync", ["github", "airtable", "charityapi"]))
        .unwrap();
    let status = wait_terminal(&governor, &id).await;
    handle.shutdown().await;

    assert!(matches!(status, CascadeStatus::Completed { .. }));
    let apis: Vec<_> = executor.calls().into_iter().map(|(_, api)| api).collect();
    assert_eq!(apis, vec!["github", "airtable", "charityapi"]);

    let snapshot = governor.snapshot();
    assert_eq!(snapshot.requests_approved, 3);
    assert_eq!(snapshot.cascade_successes, 3);
    assert_eq!(snapshot.cascades.completed, 1);
}

#[tokio::test]
async fn test_step_failure_truncates_remaining_steps() {
    let executor = Arc::new(RecordingExecutor::failing(&[("enrich", "airtable")]));
    let governor = Governor::new(fast_config(), executor.clone());
    let handle = governor.start();

    let id = governor
        .submit(CascadeSpec::new("enrich", ["github", "airtable", "openai"]))
        .unwrap();
    let status = wait_terminal(&governor, &id).await;
    handle.shutdown().await;

    match status {
        CascadeStatus::Failed { api, reason, .. } => {
            assert_eq!(api, "airtable");
            assert!(reason.contains("upstream returned 500"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // openai is never asked for or called
    assert_eq!(executor.calls().len(), 2);
    let snapshot = governor.snapshot();
    assert_eq!(snapshot.requests_approved, 2);
    assert_eq!(snapshot.cascade_successes, 1);
    assert_eq!(snapshot.cascade_failures, 1);
    assert_eq!(snapshot.cascades.failed, 1);
}

#[tokio::test]
async fn test_rate_limited_cascades_fail_fast() {
    let mut config = fast_config();
    config.apis = BTreeMap::from([("github".to_string(), ApiLimits::new(60, 5))]);
    // Rate-limit denials count as failures; keep them from pausing intake.
    config.processor.health.failure_rate_ceiling = 1.0;

    let executor = Arc::new(RecordingExecutor::default());
    let governor = Governor::new(config, executor.clone());
    let handle = governor.start();

    let ids: Vec<_> = (0..20)
        .map(|i| {
            governor
                .submit(CascadeSpec::new(format!("burst_{}", i), ["github"]))
                .unwrap()
        })
        .collect();

    let mut completed = 0;
    let mut rate_limited = 0;
    for id in &ids {
        match wait_terminal(&governor, id).await {
            CascadeStatus::Completed { .. } => completed += 1,
            CascadeStatus::Failed { reason, .. } if reason == "rate limit exceeded" => {
                rate_limited += 1
            }
            other => panic!("unexpected status {:?}", other),
        }
    }
    handle.shutdown().await;

    assert!(completed <= 5);
    assert!(rate_limited >= 15);
    assert_eq!(completed + rate_limited, 20);
    assert_eq!(executor.calls().len(), completed);

    let snapshot = governor.snapshot();
    assert!(snapshot.requests_approved <= 5);
    assert!(snapshot.rate_limit_blocks >= 15);
    assert_eq!(snapshot.api_utilization["github"], 100.0);
}

#[tokio::test]
async fn test_active_ceiling_requeues_under_backpressure() {
    let mut config = fast_config();
    config.processor.health.max_active_cascades = 1;

    let executor = Arc::new(GatedExecutor {
        gate: Semaphore::new(0),
    });
    let governor = Governor::new(config, executor.clone());
    let handle = governor.start();

    let first = governor
        .submit(CascadeSpec::new("first", ["github"]))
        .unwrap();
    let second = governor
        .submit(CascadeSpec::new("second", ["github"]))
        .unwrap();

    wait_for(&governor, &first, |s| matches!(s, CascadeStatus::Active { .. })).await;
    let waiting = wait_for(&governor, &second, |s| {
        matches!(s, CascadeStatus::Queued { requeues, .. } if *requeues >= 1)
    })
    .await;

    assert!(matches!(
        waiting,
        CascadeStatus::Queued {
            last_dequeued_at: Some(_),
            ..
        }
    ));
    assert_eq!(governor.active_cascades(), 1);
    assert!(governor.is_paused());

    executor.gate.add_permits(2);

    assert!(matches!(
        wait_terminal(&governor, &first).await,
        CascadeStatus::Completed { .. }
    ));
    assert!(matches!(
        wait_terminal(&governor, &second).await,
        CascadeStatus::Completed { .. }
    ));
    handle.shutdown().await;

    let snapshot = governor.snapshot();
    assert_eq!(snapshot.cascades.peak_active, 1);
    assert!(snapshot.cascades.requeued >= 1);
    assert_eq!(snapshot.cascades.completed, 2);
}

#[tokio::test]
async fn test_panicking_step_releases_active_slot() {
    let mut config = fast_config();
    config.processor.health.max_active_cascades = 1;

    let governor = Governor::new(config, Arc::new(PanickingExecutor));
    let handle = governor.start();

    let bad = governor.submit(CascadeSpec::new("bad", ["github"])).unwrap();
    match wait_terminal(&governor, &bad).await {
        CascadeStatus::Failed { api, reason, .. } => {
            assert_eq!(api, "github");
            assert!(reason.contains("panicked"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let good = governor.submit(CascadeSpec::new("good", ["github"])).unwrap();
    assert!(matches!(
        wait_terminal(&governor, &good).await,
        CascadeStatus::Completed { .. }
    ));
    handle.shutdown().await;

    assert_eq!(governor.active_cascades(), 0);
    let snapshot = governor.snapshot();
    assert_eq!(snapshot.cascades.failed, 1);
    assert_eq!(snapshot.cascades.completed, 1);
    assert_eq!(snapshot.cascade_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_never_disappears_while_cascades_finish() {
    let governor = Governor::new(fast_config(), Arc::new(RecordingExecutor::default()));
    let handle = governor.start();

    let ids: Vec<_> = (0..10)
        .map(|i| {
            governor
                .submit(CascadeSpec::new(format!("watched_{}", i), ["github"]))
                .unwrap()
        })
        .collect();

    let watchers: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let governor = governor.clone();
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_secs(5), async {
                    loop {
                        match governor.status(&id).await {
                            Some(status) if status.is_terminal() => return status,
                            Some(_) => tokio::task::yield_now().await,
                            None => panic!("cascade {} has no status", id),
                        }
                    }
                })
                .await
                .expect("cascade never finished")
            })
        })
        .collect();

    for watcher in watchers {
        assert!(matches!(
            watcher.await.unwrap(),
            CascadeStatus::Completed { .. }
        ));
    }
    handle.shutdown().await;

    let snapshot = governor.snapshot();
    assert_eq!(snapshot.cascades.completed, 10);
    assert!(snapshot.cascades.retained <= 10);
}

#[tokio::test]
async fn test_failing_cascade_does_not_block_others_on_same_api() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 1;

    let executor = Arc::new(RecordingExecutor::failing(&[("flaky", "openai")]));
    let governor = Governor::new(config, executor.clone());
    let handle = governor.start();

    let flaky = governor
        .submit(CascadeSpec::new("flaky", ["openai"]))
        .unwrap();
    wait_terminal(&governor, &flaky).await;

    let healthy = governor
        .submit(CascadeSpec::new("healthy", ["openai"]))
        .unwrap();
    let status = wait_terminal(&governor, &healthy).await;
    handle.shutdown().await;

    assert!(matches!(status, CascadeStatus::Completed { .. }));

    // The failing pair is open; the healthy pair never saw a failure.
    let decision = governor
        .request_permission(flaky.as_str(), "openai")
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "circuit breaker open");
    assert_eq!(governor.snapshot().circuit_breakers.open, 1);
}

#[tokio::test]
async fn test_shutdown_writes_final_metrics_file() {
    let dir = std::env::temp_dir().join(format!("cascade-governor-it-{}", std::process::id()));
    let path = dir.join("cascade_governor.json");

    let executor = Arc::new(RecordingExecutor::default());
    let mut governor = Governor::new(fast_config(), executor);
    governor.add_sink(Arc::new(JsonFileSink::new(&path)));
    let handle = governor.start();

    let id = governor
        .submit(CascadeSpec::new("report", ["perplexity"]))
        .unwrap();
    wait_terminal(&governor, &id).await;
    handle.shutdown().await;

    let written = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(json["requests_approved"], 1);
    assert_eq!(json["cascade_successes"], 1);
    assert_eq!(json["success_rate"], 1.0);
    assert!(json["cascades"]["retained"].is_u64());
    assert!(json["timestamp"].is_string());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_client_fails_open_once_governor_stops() {
    let governor = Governor::new(fast_config(), Arc::new(RecordingExecutor::default()));
    let client = GovernorClient::new(Arc::new(governor.transport()), ClientConfig::default());

    let handle = governor.start();
    let id = client
        .submit(&CascadeSpec::new("via_client", ["github"]))
        .await
        .unwrap();
    wait_terminal(&governor, &id).await;
    handle.shutdown().await;

    let decision = client.request_permission(id.as_str(), "github").await.unwrap();
    assert!(decision.allowed);
    assert_ne!(decision.reason, "approved");

    assert!(client
        .submit(&CascadeSpec::new("too_late", ["github"]))
        .await
        .is_err());
}
