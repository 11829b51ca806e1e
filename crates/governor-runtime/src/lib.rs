//! # governor-runtime
//!
//! The running cascade governor.
//!
//! `governor-core` decides whether a single call may proceed. This crate
//! turns that into a service:
//! - an intake queue that cascades are submitted to
//! - a processor loop that activates queued cascades under a health
//!   predicate and runs their steps through admission control
//! - a telemetry loop that publishes metrics snapshots
//! - a client protocol with an explicit fallback policy for callers
//!
//! ## Example
//!
//! ```rust,ignore
//! use governor_runtime::{GovernorBuilder, TracingSink};
//!
//! let governor = GovernorBuilder::new()
//!     .config(config)
//!     .executor(Arc::new(MyStepExecutor))
//!     .sink(Arc::new(TracingSink))
//!     .build()?;
//!
//! let handle = governor.start();
//! let id = governor.submit(CascadeSpec::new("sync_grants", ["github", "airtable"]))?;
//! // ...
//! handle.shutdown().await;
//! ```

mod executor;
mod governor;
mod outcomes;
mod processor;
mod queue;

pub mod client;
pub mod hooks;
pub mod telemetry;

pub use client::{ClientError, GovernorClient, GovernorTransport, LocalTransport, ResultReport};
pub use executor::{StepError, StepExecutor};
pub use governor::{Governor, GovernorBuilder, GovernorHandle};
pub use hooks::{governed, CascadeSession, GovernedError, SessionError};
pub use outcomes::OutcomeStore;
pub use queue::CascadeQueue;
pub use telemetry::{JsonFileSink, MetricsSink, SinkError, TelemetryEmitter, TracingSink};

use governor_core::{ConfigError, GovernorError};
use thiserror::Error;

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Step executor not configured")]
    ExecutorNotConfigured,

    #[error("Governor is shut down")]
    ShutDown,

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
