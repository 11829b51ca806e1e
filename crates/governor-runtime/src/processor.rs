//! The processor loop: dequeue, check health, activate, execute.
//!
//! # Execution Flow
//! 1. Dequeue with a poll timeout so health is re-evaluated while idle
//! 2. Assess the health predicate before activating
//! 3. Under backpressure: send the cascade to the tail, back off, retry
//! 4. Otherwise: mark it active and run it in its own task
//! 5. Each step asks permission first; any denial or step failure ends
//!    the cascade immediately

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use governor_core::{Cascade, CascadeStatus, HealthVerdict, PauseReason};

use crate::executor::{StepError, StepExecutor};
use crate::governor::{active_status, requeued_status, GovernorState};

pub(crate) struct Processor {
    state: Arc<GovernorState>,
    executor: Arc<dyn StepExecutor>,
    shutdown: watch::Receiver<bool>,
    running: JoinSet<()>,
}

impl Processor {
    pub(crate) fn new(
        state: Arc<GovernorState>,
        executor: Arc<dyn StepExecutor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            executor,
            shutdown,
            running: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let poll_interval = self.state.config.processor.poll_interval;
        tracing::info!(poll_interval = ?poll_interval, "Cascade processor started");

        loop {
            self.reap_finished();

            if *self.shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.state.queue.dequeue(poll_interval) => next,
            };

            let Some(mut cascade) = next else {
                continue;
            };
            cascade.last_dequeued_at = Some(Utc::now());

            let active = self.state.active.load(Ordering::SeqCst);
            let signals = self.state.admission.health_signals(active);

            match self.state.config.processor.health.assess(&signals) {
                HealthVerdict::Pause(reason) => {
                    self.requeue(cascade, &reason);
                    if !self.back_off().await {
                        break;
                    }
                }
                HealthVerdict::Healthy => {
                    self.resume();
                    self.activate(cascade);
                }
            }
        }

        let in_flight = self.running.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for in-flight cascades");
        }
        while let Some(result) = self.running.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Cascade task ended abnormally");
            }
        }

        tracing::info!("Cascade processor stopped");
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.running.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "Cascade task ended abnormally");
            }
        }
    }

    /// Send a cascade back to the tail of the queue.
    fn requeue(&self, mut cascade: Cascade, reason: &PauseReason) {
        if !self.state.paused.swap(true, Ordering::SeqCst) {
            tracing::warn!(reason = %reason, "Pausing cascade intake");
        }

        cascade.requeues += 1;
        tracing::debug!(
            cascade_id = %cascade.id,
            requeues = cascade.requeues,
            reason = %reason,
            "Cascade re-queued under backpressure"
        );

        self.state.admission.counters().cascade_requeued();
        self.state.set_live(&cascade.id, requeued_status(&cascade));
        self.state.queue.push(cascade);
    }

    /// Sleep for the pause backoff. Returns false if shutdown was requested.
    async fn back_off(&mut self) -> bool {
        let backoff = self.state.config.processor.pause_backoff;
        tokio::select! {
            _ = tokio::time::sleep(backoff) => true,
            changed = self.shutdown.changed() => changed.is_ok() && !*self.shutdown.borrow(),
        }
    }

    fn resume(&self) {
        if self.state.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Resuming cascade intake");
        }
    }

    fn activate(&mut self, cascade: Cascade) {
        let active_now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.admission.counters().cascade_started(active_now);
        self.state.set_live(&cascade.id, active_status());

        tracing::info!(
            cascade_id = %cascade.id,
            name = %cascade.spec.name,
            active = active_now,
            "Cascade started"
        );

        let state = self.state.clone();
        let executor = self.executor.clone();
        self.running.spawn(async move {
            execute_cascade(&state, executor.as_ref(), &cascade).await;
        });
    }
}

/// Run every step of a cascade through admission control, fail-fast.
pub(crate) async fn execute_cascade(
    state: &GovernorState,
    executor: &dyn StepExecutor,
    cascade: &Cascade,
) {
    let id = cascade.id.as_str();

    for api in cascade.required_apis() {
        let decision = match state.admission.request_permission(id, api) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(cascade_id = id, api = %api, error = %e, "Permission request rejected");
                fail(state, cascade, api, e.to_string()).await;
                return;
            }
        };

        if !decision.allowed {
            tracing::warn!(cascade_id = id, api = %api, reason = %decision.reason, "Cascade blocked");
            report(state, id, api, false, &decision.reason);
            fail(state, cascade, api, decision.reason).await;
            return;
        }

        // No governor lock is held here. A panicking step fails the cascade
        // like any other step error so its active slot is released.
        let outcome = AssertUnwindSafe(executor.execute(cascade, api))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(StepError::Internal("step executor panicked".to_string())));

        match outcome {
            Ok(()) => report(state, id, api, true, ""),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(cascade_id = id, api = %api, error = %message, "Cascade step failed");
                report(state, id, api, false, &message);
                fail(state, cascade, api, message).await;
                return;
            }
        }
    }

    tracing::info!(cascade_id = id, "Cascade completed");
    state
        .finish(
            &cascade.id,
            CascadeStatus::Completed {
                finished_at: Utc::now(),
            },
        )
        .await;
}

fn report(state: &GovernorState, cascade_id: &str, api: &str, success: bool, error: &str) {
    if let Err(e) = state
        .admission
        .record_result(cascade_id, api, success, error)
    {
        tracing::error!(cascade_id, api, error = %e, "Failed to record step result");
    }
}

async fn fail(state: &GovernorState, cascade: &Cascade, api: &str, reason: String) {
    state
        .finish(
            &cascade.id,
            CascadeStatus::Failed {
                api: api.to_string(),
                reason,
                finished_at: Utc::now(),
            },
        )
        .await;
}
