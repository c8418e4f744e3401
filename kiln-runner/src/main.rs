//! Kiln runner binary
//!
//! Loads a job plan, runs it to completion and reports how every job ended.

use anyhow::{Context, Result};
use kiln_core::domain::job::JobStatus;
use kiln_core::dto::plan::JobPlan;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_runner::Config;
use kiln_runner::cache::{DirectoryJobCache, InMemoryJobCache, JobCache};
use kiln_runner::container::{ApptainerRuntime, PodmanRuntime, Provisioning};
use kiln_runner::handler::{JobHandler, ProcessHandler};
use kiln_runner::job::Job;
use kiln_runner::plan::{self, PlanContext};
use kiln_runner::scheduler::JobManager;
use kiln_runner::staging::WorkspaceStager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: plan={}, workspace={}, runtime_mode={:?}",
        config.plan_path.display(),
        config.workspace_base.display(),
        config.runtime_mode
    );

    let plan = read_plan(&config)?;
    info!("Plan contains {} job(s)", plan.jobs.len());

    let runtime = tokio::runtime::Handle::current();
    let handler = Arc::new(
        ProcessHandler::new("process", config.max_parallel_jobs, runtime)
            .with_workspace_base(&config.workspace_base),
    );
    let context = PlanContext {
        handler: handler.clone(),
        cache: Some(open_cache(&config)?),
        provisioning: provisioning(&config),
    };
    let jobs = plan::build_jobs(&plan, &context).context("Failed to build jobs from plan")?;

    let mut manager = JobManager::new()
        .with_stager(Arc::new(WorkspaceStager::new(&config.workspace_base)))
        .with_poll_interval(config.poll_interval);
    for job in &jobs {
        manager.queue_job(Arc::clone(job));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            on_signal.cancel();
        }
    });

    info!("Running jobs, poll interval: {:?}", config.poll_interval);
    let drained = manager.wait_with_cancel(config.wait_timeout, &cancel).await;

    let failed = report(&jobs);
    info!("Handler counters: {:?}", handler.counters().snapshot());

    if !drained {
        anyhow::bail!("Stopped before all jobs completed");
    }
    if failed > 0 {
        anyhow::bail!("{} job(s) failed", failed);
    }

    info!("All jobs completed");
    Ok(())
}

/// Loads configuration from environment variables
///
/// A path given as the first argument takes precedence over `KILN_PLAN`.
fn load_config() -> Result<Config> {
    let config = match std::env::args().nth(1) {
        Some(plan_path) => Config::from_lookup(|key| match key {
            "KILN_PLAN" => Some(plan_path.clone()),
            _ => std::env::var(key).ok(),
        })?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn read_plan(config: &Config) -> Result<JobPlan> {
    let text = std::fs::read_to_string(&config.plan_path)
        .with_context(|| format!("Failed to read plan {}", config.plan_path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse plan {}", config.plan_path.display()))
}

fn open_cache(config: &Config) -> Result<Arc<dyn JobCache>> {
    match &config.cache_dir {
        Some(dir) => {
            let cache = DirectoryJobCache::open(dir)
                .with_context(|| format!("Failed to open cache {}", dir.display()))?;
            info!("Using result cache at {}", dir.display());
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(InMemoryJobCache::new())),
    }
}

fn provisioning(config: &Config) -> Provisioning {
    Provisioning::new(
        config.runtime_mode,
        Arc::new(PodmanRuntime::new(config.primary_runtime.clone())),
        Arc::new(ApptainerRuntime::new(
            config.alternate_runtime.clone(),
            config.image_dir(),
        )),
    )
}

/// Logs how each job ended and returns the number of failures
fn report(jobs: &[Arc<Job>]) -> usize {
    let mut failed = 0;
    for job in jobs {
        match job.status() {
            JobStatus::Finished if job.is_from_cache() => {
                info!("  {} finished (cached)", job.name())
            }
            JobStatus::Finished => info!("  {} finished", job.name()),
            JobStatus::Error => {
                failed += 1;
                error!(
                    "  {} failed: {}",
                    job.name(),
                    job.error().unwrap_or_default()
                );
            }
            status => warn!("  {} left {}", job.name(), status),
        }
    }
    failed
}
