//! Subprocess handler
//!
//! Runs each job's command as a child process, inside the job's container
//! image when it has one. A semaphore caps the children running at once at
//! `max_parallel_jobs`; further dispatches wait in a queue that `iterate`
//! drains as permits free up.
//!
//! Resolved inputs reach the child as `KILN_INPUT_<NAME>` environment
//! variables. The trimmed stdout becomes the job result, parsed as JSON when
//! it is valid JSON and kept as a string otherwise.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use super::{HandlerCounters, JobHandler};
use crate::container::ExecSpec;
use crate::job::Job;
use crate::staging::workspace_path;

/// Prefix of the environment variables carrying job inputs
pub const INPUT_ENV_PREFIX: &str = "KILN_INPUT_";

/// Handler executing jobs as subprocesses
pub struct ProcessHandler {
    name: String,
    max_parallel_jobs: usize,
    workspace_base: Option<PathBuf>,
    pending: Mutex<VecDeque<Arc<Job>>>,
    semaphore: Arc<Semaphore>,
    runtime: Handle,
    counters: HandlerCounters,
}

impl ProcessHandler {
    /// Creates a handler running up to `max_parallel_jobs` children at once
    ///
    /// Children are awaited on tasks spawned onto `runtime`.
    pub fn new(name: impl Into<String>, max_parallel_jobs: usize, runtime: Handle) -> Self {
        let max_parallel_jobs = max_parallel_jobs.max(1);
        Self {
            name: name.into(),
            max_parallel_jobs,
            workspace_base: None,
            pending: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(max_parallel_jobs)),
            runtime,
            counters: HandlerCounters::new(),
        }
    }

    /// Runs each job in `<base>/<job id>` when that directory exists
    pub fn with_workspace_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.workspace_base = Some(base.into());
        self
    }

    /// Children currently executing
    pub fn running(&self) -> usize {
        self.max_parallel_jobs - self.semaphore.available_permits()
    }

    /// Jobs accepted but not started yet
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Starts pending jobs while permits are available
    fn start_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        while !pending.is_empty() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                debug!(
                    "Max parallel jobs reached, {} job(s) waiting in handler {}",
                    pending.len(),
                    self.name
                );
                break;
            };
            if let Some(job) = pending.pop_front() {
                self.spawn_job_task(job, permit);
            }
        }
    }

    /// Spawns a task running a single job
    fn spawn_job_task(&self, job: Arc<Job>, permit: OwnedSemaphorePermit) {
        let workspace = self
            .workspace_base
            .as_ref()
            .map(|base| workspace_path(base, job.id()))
            .filter(|path| path.is_dir());

        self.runtime.spawn(async move {
            let outcome = run_job(&job, workspace).await;
            complete(&job, outcome);
            drop(permit);
        });
    }
}

impl JobHandler for ProcessHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, job: Arc<Job>) {
        debug!("Handler {} accepted job {}", self.name, job.name());
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job);
        self.start_pending();
    }

    fn iterate(&self) {
        self.start_pending();
    }

    fn counters(&self) -> &HandlerCounters {
        &self.counters
    }
}

/// Records the outcome of a run on the job
fn complete(job: &Job, outcome: Result<JsonValue>) {
    match outcome {
        Ok(value) => {
            info!("Job {} finished", job.name());
            if let Err(e) = job.finish(value) {
                error!("Could not record result of job {}: {}", job.name(), e);
            }
        }
        Err(e) => {
            error!("Job {} failed: {:#}", job.name(), e);
            job.fail(format!("{:#}", e));
        }
    }
}

/// Executes the job's command and returns its parsed stdout
async fn run_job(job: &Job, workspace: Option<PathBuf>) -> Result<JsonValue> {
    let argv = job.command();
    if argv.is_empty() {
        anyhow::bail!("Job {} has no command", job.name());
    }

    let env = input_env(&job.inputs());
    let mut command = match job.image() {
        Some(image) => Command::from(image.command(ExecSpec {
            argv,
            workspace: workspace.as_deref(),
            env: &env,
        })),
        None => {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]).envs(env.iter().cloned());
            if let Some(dir) = &workspace {
                command.current_dir(dir);
            }
            command
        }
    };

    debug!("Running job {}: {:?}", job.name(), command);

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute '{}'", argv[0]))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!("Job {} stderr: {}", job.name(), stderr.trim());
    }

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "Command exited with code {}: stderr='{}'",
            exit_code,
            stderr.trim()
        );
    }

    Ok(parse_output(stdout.trim()))
}

/// Converts inputs to environment variables
///
/// Names are upper-cased with non-alphanumeric characters replaced by `_`.
/// Strings are passed as-is, `null` as an empty string and everything else
/// as JSON text.
pub fn input_env(inputs: &BTreeMap<String, JsonValue>) -> Vec<(String, String)> {
    inputs
        .iter()
        .map(|(name, value)| {
            let key: String = name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();

            let value = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };

            (format!("{}{}", INPUT_ENV_PREFIX, key), value)
        })
        .collect()
}

fn parse_output(stdout: &str) -> JsonValue {
    serde_json::from_str(stdout).unwrap_or_else(|_| JsonValue::String(stdout.to_string()))
}
