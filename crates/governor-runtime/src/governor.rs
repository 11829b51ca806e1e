//! The governor: shared state plus the background loops that drive it.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use governor_core::{
    AdmissionController, Cascade, CascadeId, CascadeIdGenerator, CascadeSpec, CascadeStatus,
    CircuitStatus, Clock, GovernorConfig, GovernorError, MetricsSnapshot, PermissionDecision,
    SystemClock,
};

use crate::client::LocalTransport;
use crate::executor::StepExecutor;
use crate::outcomes::OutcomeStore;
use crate::processor::Processor;
use crate::queue::CascadeQueue;
use crate::telemetry::{MetricsSink, TelemetryEmitter};
use crate::RuntimeError;

/// Everything the governor owns for its lifetime.
#[derive(Debug)]
pub(crate) struct GovernorState {
    pub(crate) config: GovernorConfig,
    pub(crate) admission: AdmissionController,
    pub(crate) queue: CascadeQueue,
    pub(crate) ids: CascadeIdGenerator,

    /// Queued and active cascades
    pub(crate) live: RwLock<HashMap<CascadeId, CascadeStatus>>,
    pub(crate) outcomes: OutcomeStore,
    pub(crate) active: AtomicUsize,
    pub(crate) paused: AtomicBool,
    pub(crate) accepting: AtomicBool,
}

impl GovernorState {
    pub(crate) fn set_live(&self, id: &CascadeId, status: CascadeStatus) {
        self.live.write().insert(id.clone(), status);
    }

    /// Move a cascade from the live set into retained outcomes.
    ///
    /// The outcome is stored before the live entry goes away, so a status
    /// lookup always finds the cascade in one of the two.
    pub(crate) async fn finish(&self, id: &CascadeId, status: CascadeStatus) {
        let completed = matches!(status, CascadeStatus::Completed { .. });

        self.outcomes.insert(id.clone(), status).await;
        self.live.write().remove(id);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if completed {
            self.admission.counters().cascade_completed();
        } else {
            self.admission.counters().cascade_failed();
        }
    }

    pub(crate) fn submit(&self, spec: CascadeSpec) -> Result<CascadeId, RuntimeError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }

        self.admission.validate_spec(&spec)?;

        let id = self.ids.next_id();
        let cascade = Cascade::new(id.clone(), spec);

        tracing::info!(
            cascade_id = %id,
            name = %cascade.spec.name,
            apis = ?cascade.spec.required_apis,
            priority = ?cascade.spec.priority,
            "Cascade queued"
        );

        self.set_live(
            &id,
            CascadeStatus::Queued {
                requeues: 0,
                last_dequeued_at: None,
            },
        );
        self.admission.counters().cascade_queued();
        self.queue.push(cascade);

        Ok(id)
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.admission.snapshot(
            self.active.load(Ordering::SeqCst),
            self.queue.len(),
            self.paused.load(Ordering::SeqCst),
        );
        snapshot.cascades.retained = self.outcomes.entry_count();
        snapshot
    }
}

/// Handle to a governor. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Governor {
    state: Arc<GovernorState>,
    executor: Arc<dyn StepExecutor>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Governor {
    /// Create a governor using the system clock.
    pub fn new(config: GovernorConfig, executor: Arc<dyn StepExecutor>) -> Self {
        Self::with_clock(config, executor, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GovernorConfig,
        executor: Arc<dyn StepExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let admission = AdmissionController::with_clock(&config, clock);
        let outcomes = OutcomeStore::new(config.outcomes.capacity, config.outcomes.retention);

        let state = GovernorState {
            config,
            admission,
            queue: CascadeQueue::new(),
            ids: CascadeIdGenerator::new(),
            live: RwLock::new(HashMap::new()),
            outcomes,
            active: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        };

        Self {
            state: Arc::new(state),
            executor,
            sinks: Vec::new(),
        }
    }

    /// Add a telemetry sink. Only affects loops started afterwards.
    pub fn add_sink(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    /// Spawn the processor and telemetry loops.
    pub fn start(&self) -> GovernorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = Processor::new(
            self.state.clone(),
            self.executor.clone(),
            shutdown_rx.clone(),
        );
        let telemetry = TelemetryEmitter::new(
            self.clone(),
            self.sinks.clone(),
            self.state.config.telemetry.interval,
        );

        tracing::info!(
            apis = self.state.config.apis.len(),
            max_active = self.state.config.processor.health.max_active_cascades,
            "Cascade governor started"
        );

        GovernorHandle {
            governor: self.clone(),
            shutdown: shutdown_tx,
            processor: tokio::spawn(processor.run()),
            telemetry: tokio::spawn(telemetry.run(shutdown_rx)),
        }
    }

    /// Queue a cascade. Never blocks; returns the assigned id.
    pub fn submit(&self, spec: CascadeSpec) -> Result<CascadeId, RuntimeError> {
        self.state.submit(spec)
    }

    /// Ask permission for one API call.
    pub fn request_permission(
        &self,
        cascade_id: &str,
        api_name: &str,
    ) -> Result<PermissionDecision, GovernorError> {
        self.state.admission.request_permission(cascade_id, api_name)
    }

    /// Report the outcome of an API call.
    pub fn record_result(
        &self,
        cascade_id: &str,
        api_name: &str,
        success: bool,
        error_message: &str,
    ) -> Result<CircuitStatus, GovernorError> {
        self.state
            .admission
            .record_result(cascade_id, api_name, success, error_message)
    }

    /// Current or retained status of a cascade.
    pub async fn status(&self, id: &CascadeId) -> Option<CascadeStatus> {
        let live = self.state.live.read().get(id).cloned();
        match live {
            Some(status) => Some(status),
            None => self.state.outcomes.get(id).await,
        }
    }

    /// Compute a metrics snapshot now.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.state.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.state.admission
    }

    pub fn active_cascades(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn queued_cascades(&self) -> usize {
        self.state.queue.len()
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::SeqCst)
    }

    /// In-process transport for [`crate::GovernorClient`].
    ///
    /// Holds only a weak reference; once the governor is shut down or
    /// dropped the transport reports it as unavailable.
    pub fn transport(&self) -> LocalTransport {
        LocalTransport::new(Arc::downgrade(&self.state))
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.accepting.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("active", &self.active_cascades())
            .field("queued", &self.queued_cascades())
            .field("paused", &self.is_paused())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Running loops of a started governor.
pub struct GovernorHandle {
    governor: Governor,
    shutdown: watch::Sender<bool>,
    processor: JoinHandle<()>,
    telemetry: JoinHandle<()>,
}

impl GovernorHandle {
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Stop intake, wait for in-flight cascades, and stop both loops.
    pub async fn shutdown(self) {
        self.governor.mark_stopped();
        let _ = self.shutdown.send(true);

        if let Err(e) = self.processor.await {
            tracing::error!(error = %e, "Processor task ended abnormally");
        }
        if let Err(e) = self.telemetry.await {
            tracing::error!(error = %e, "Telemetry task ended abnormally");
        }

        tracing::info!(
            queued = self.governor.queued_cascades(),
            "Cascade governor stopped"
        );
    }
}

/// Builder for [`Governor`].
pub struct GovernorBuilder {
    config: GovernorConfig,
    executor: Option<Arc<dyn StepExecutor>>,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl GovernorBuilder {
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            executor: None,
            clock: Arc::new(SystemClock),
            sinks: Vec::new(),
        }
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the executor that performs cascade steps.
    pub fn executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a telemetry sink.
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<Governor, RuntimeError> {
        self.config.validate()?;

        let executor = self.executor.ok_or(RuntimeError::ExecutorNotConfigured)?;

        let mut governor = Governor::with_clock(self.config, executor, self.clock);
        for sink in self.sinks {
            governor.add_sink(sink);
        }

        Ok(governor)
    }
}

impl Default for GovernorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status written when a cascade is pulled off the queue and sent back.
pub(crate) fn requeued_status(cascade: &Cascade) -> CascadeStatus {
    CascadeStatus::Queued {
        requeues: cascade.requeues,
        last_dequeued_at: cascade.last_dequeued_at,
    }
}

/// Status written when a cascade becomes active.
pub(crate) fn active_status() -> CascadeStatus {
    CascadeStatus::Active {
        started_at: Utc::now(),
    }
}
