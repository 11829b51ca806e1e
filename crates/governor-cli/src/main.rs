//! cascade-governor: run the governor, optionally under simulated load.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use governor_core::{Cascade, CascadeSpec, GovernorConfig, Priority};
use governor_runtime::{GovernorBuilder, JsonFileSink, StepError, StepExecutor, TracingSink};

const DEFAULT_METRICS_PATH: &str = "metrics/cascade_governor.json";
const DEMO_APIS: [&str; 3] = ["github", "airtable", "charityapi"];

#[derive(Parser)]
#[command(name = "cascade-governor")]
#[command(about = "Admission control for cascades of rate-limited API calls", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the governor
    Run {
        /// Configuration file (YAML or JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the metrics snapshot
        #[arg(long)]
        metrics_path: Option<PathBuf>,

        /// Submit this many simulated cascades
        #[arg(long, default_value_t = 0)]
        demo_cascades: usize,

        /// Delay between simulated submissions
        #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
        demo_interval: Duration,

        /// Stop after this long instead of waiting for Ctrl-C
        #[arg(long, value_parser = humantime::parse_duration)]
        run_for: Option<Duration>,

        /// Simulated latency of each step
        #[arg(long, value_parser = humantime::parse_duration, default_value = "50ms")]
        step_latency: Duration,

        /// Every N-th simulated step fails (0 never fails)
        #[arg(long, default_value_t = 7)]
        fail_every: u64,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file (YAML or JSON)
        file: PathBuf,
    },

    /// Print the default configuration as YAML
    DefaultConfig,
}

/// Stands in for real API calls.
struct SimulatedExecutor {
    latency: Duration,
    fail_every: u64,
    calls: AtomicU64,
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn execute(&self, cascade: &Cascade, api: &str) -> Result<(), StepError> {
        tokio::time::sleep(self.latency).await;

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            tracing::debug!(cascade_id = %cascade.id, api, call, "Simulated step failure");
            return Err(StepError::failed(api, "simulated upstream error"));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            metrics_path,
            demo_cascades,
            demo_interval,
            run_for,
            step_latency,
            fail_every,
        } => {
            let mut config = load_config(config.as_deref())?;
            if metrics_path.is_some() {
                config.telemetry.metrics_path = metrics_path;
            }

            let executor = SimulatedExecutor {
                latency: step_latency,
                fail_every,
                calls: AtomicU64::new(0),
            };
            run(config, Arc::new(executor), demo_cascades, demo_interval, run_for).await?;
        }

        Commands::CheckConfig { file } => {
            let config = GovernorConfig::from_file(&file)
                .with_context(|| format!("Invalid configuration: {}", file.display()))?;

            println!("✓ Configuration valid: {}", file.display());
            println!("  APIs: {}", config.apis.len());
            for (name, limits) in &config.apis {
                println!(
                    "    - {}: {}/min, {}/hour",
                    name, limits.requests_per_minute, limits.requests_per_hour
                );
            }
            println!(
                "  Breaker: threshold {}, open timeout {}",
                config.circuit_breaker.failure_threshold,
                humantime::format_duration(config.circuit_breaker.open_timeout)
            );
            println!(
                "  Max active cascades: {}",
                config.processor.health.max_active_cascades
            );
        }

        Commands::DefaultConfig => {
            print!("{}", GovernorConfig::default().to_yaml()?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<GovernorConfig> {
    match path {
        Some(path) => GovernorConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(GovernorConfig::default()),
    }
}

async fn run(
    config: GovernorConfig,
    executor: Arc<dyn StepExecutor>,
    demo_cascades: usize,
    demo_interval: Duration,
    run_for: Option<Duration>,
) -> Result<()> {
    let metrics_path = config
        .telemetry
        .metrics_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_METRICS_PATH));

    let governor = GovernorBuilder::new()
        .config(config)
        .executor(executor)
        .sink(Arc::new(TracingSink))
        .sink(Arc::new(JsonFileSink::new(&metrics_path)))
        .build()
        .context("Failed to build governor")?;

    let handle = governor.start();
    tracing::info!(metrics_path = %metrics_path.display(), "Writing metrics");

    let load = {
        let governor = governor.clone();
        tokio::spawn(async move {
            for i in 0..demo_cascades {
                // Every fifth demo cascade stands in for an urgent trigger.
                let priority = if (i + 1) % 5 == 0 {
                    Priority::High
                } else {
                    Priority::Normal
                };
                let spec = CascadeSpec::new(format!("demo_cascade_{}", i + 1), DEMO_APIS)
                    .with_payload(serde_json::json!({ "demo": true, "sequence": i + 1 }))
                    .with_priority(priority);
                if let Err(e) = governor.submit(spec) {
                    tracing::error!(error = %e, "Demo submission rejected");
                    break;
                }
                tokio::time::sleep(demo_interval).await;
            }
        })
    };

    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted");
        }
    }

    load.abort();
    handle.shutdown().await;

    let snapshot = governor.snapshot();
    println!("{}", snapshot.to_json_pretty()?);
    Ok(())
}
