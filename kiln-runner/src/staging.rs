//! Input staging
//!
//! Makes the files a job needs available before the job is queued. Each job
//! gets its own workspace directory, `<base>/<job id>`, which the process
//! handler later mounts or runs in.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::job::Job;

/// Prepares a job's inputs on the local machine
pub trait InputStager: Send + Sync {
    /// Stages every file the job requires
    ///
    /// An error fails the job before it enters the scheduler.
    fn stage(&self, job: &Job) -> Result<()>;
}

/// Copies required files into a per-job workspace
#[derive(Debug, Clone)]
pub struct WorkspaceStager {
    base: PathBuf,
}

impl WorkspaceStager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Workspace directory of a job
    pub fn workspace_for(&self, job_id: Uuid) -> PathBuf {
        workspace_path(&self.base, job_id)
    }
}

/// `<base>/<job id>`
pub fn workspace_path(base: &Path, job_id: Uuid) -> PathBuf {
    base.join(job_id.to_string())
}

impl InputStager for WorkspaceStager {
    fn stage(&self, job: &Job) -> Result<()> {
        let workspace = self.workspace_for(job.id());
        fs::create_dir_all(&workspace).with_context(|| {
            format!("Failed to create workspace directory {}", workspace.display())
        })?;

        for source in job.required_files() {
            let file_name = source
                .file_name()
                .with_context(|| format!("Required path {} has no file name", source.display()))?;
            let target = workspace.join(file_name);

            fs::copy(source, &target).with_context(|| {
                format!(
                    "Failed to stage {} into {}",
                    source.display(),
                    workspace.display()
                )
            })?;
            debug!("Staged {} for job {}", target.display(), job.name());
        }

        Ok(())
    }
}
