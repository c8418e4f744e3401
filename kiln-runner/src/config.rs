//! Runner configuration
//!
//! Defines the configurable parameters of the runner: the plan to execute,
//! scheduling cadence, container runtime selection, workspace and cache
//! locations.

use std::path::PathBuf;
use std::time::Duration;

use crate::container::RuntimeMode;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON job plan to execute
    pub plan_path: PathBuf,

    /// Pause between scheduling passes while waiting
    pub poll_interval: Duration,

    /// Maximum time to wait for the plan; `None` waits until it drains
    pub wait_timeout: Option<Duration>,

    /// Which runtime pulls remote images
    pub runtime_mode: RuntimeMode,

    /// Primary runtime binary
    pub primary_runtime: String,

    /// Alternate runtime binary
    pub alternate_runtime: String,

    /// Base directory of per-job workspaces
    pub workspace_base: PathBuf,

    /// Directory of the persistent result cache; in-memory when unset
    pub cache_dir: Option<PathBuf>,

    /// Maximum number of jobs executing at once
    pub max_parallel_jobs: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(plan_path: impl Into<PathBuf>) -> Self {
        Self {
            plan_path: plan_path.into(),
            poll_interval: Duration::from_millis(100),
            wait_timeout: None,
            runtime_mode: RuntimeMode::Primary,
            primary_runtime: "podman".to_string(),
            alternate_runtime: "apptainer".to_string(),
            workspace_base: std::env::temp_dir().join("kiln"),
            cache_dir: None,
            max_parallel_jobs: 2,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - KILN_PLAN (required)
    /// - KILN_POLL_INTERVAL_MS (optional, default: 100)
    /// - KILN_WAIT_TIMEOUT (optional, seconds, default: wait until drained)
    /// - KILN_ALTERNATE_RUNTIME (optional, `1`/`true` to pull with the alternate runtime)
    /// - KILN_PRIMARY_RUNTIME (optional, default: podman)
    /// - KILN_ALTERNATE_RUNTIME_BIN (optional, default: apptainer)
    /// - KILN_WORKSPACE (optional, default: <tmp>/kiln)
    /// - KILN_CACHE_DIR (optional, enables the directory cache)
    /// - KILN_MAX_PARALLEL_JOBS (optional, default: 2)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let plan_path = lookup("KILN_PLAN")
            .ok_or_else(|| anyhow::anyhow!("KILN_PLAN environment variable not set"))?;

        let mut config = Self::new(plan_path);

        if let Some(ms) = lookup("KILN_POLL_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
            config.poll_interval = Duration::from_millis(ms);
        }

        config.wait_timeout = lookup("KILN_WAIT_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        if lookup("KILN_ALTERNATE_RUNTIME").is_some_and(|s| is_truthy(&s)) {
            config.runtime_mode = RuntimeMode::Alternate;
        }

        if let Some(binary) = lookup("KILN_PRIMARY_RUNTIME") {
            config.primary_runtime = binary;
        }

        if let Some(binary) = lookup("KILN_ALTERNATE_RUNTIME_BIN") {
            config.alternate_runtime = binary;
        }

        if let Some(dir) = lookup("KILN_WORKSPACE") {
            config.workspace_base = PathBuf::from(dir);
        }

        config.cache_dir = lookup("KILN_CACHE_DIR").map(PathBuf::from);

        if let Some(n) = lookup("KILN_MAX_PARALLEL_JOBS").and_then(|s| s.parse::<usize>().ok()) {
            config.max_parallel_jobs = n;
        }

        Ok(config)
    }

    /// Directory holding images pulled by the alternate runtime
    pub fn image_dir(&self) -> PathBuf {
        self.workspace_base.join("images")
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.plan_path.as_os_str().is_empty() {
            anyhow::bail!("plan_path cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        if self.primary_runtime.trim().is_empty() {
            anyhow::bail!("primary_runtime cannot be empty");
        }

        if self.alternate_runtime.trim().is_empty() {
            anyhow::bail!("alternate_runtime cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("plan.json")
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
