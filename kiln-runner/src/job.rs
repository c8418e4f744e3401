//! Jobs
//!
//! A job is a unit of deferred work shared between the scheduler, which owns
//! its place in the pools, and the handler executing it, which reports the
//! outcome. All mutable state sits behind one mutex so a status written by a
//! handler thread is visible to the scheduler on its next pass.

use chrono::{DateTime, Utc};
use kiln_core::domain::job::{Fingerprint, JobOutcome, JobStatus};
use kiln_core::{KilnError, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::JobCache;
use crate::container::ContainerImage;
use crate::handler::JobHandler;

/// Binds one input of a job to the result of another job
#[derive(Clone)]
pub struct Dependency {
    input: String,
    job: Arc<Job>,
}

impl Dependency {
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }
}

/// Mutable part of a job
#[derive(Debug)]
struct JobState {
    status: JobStatus,
    inputs: BTreeMap<String, JsonValue>,
    outcome: Option<JobOutcome>,
    from_cache: bool,
    image_attempted: bool,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// A unit of deferred work
pub struct Job {
    id: Uuid,
    name: String,
    command: Vec<String>,
    dependencies: Vec<Dependency>,
    handler: Arc<dyn JobHandler>,
    cache: Option<Arc<dyn JobCache>>,
    image: Option<Arc<ContainerImage>>,
    required_files: Vec<PathBuf>,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl Job {
    /// Starts building a job executed by `handler`
    pub fn builder(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            handler,
            command: Vec::new(),
            inputs: BTreeMap::new(),
            dependencies: Vec::new(),
            cache: None,
            image: None,
            required_files: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn cache(&self) -> Option<&Arc<dyn JobCache>> {
        self.cache.as_ref()
    }

    pub fn image(&self) -> Option<&Arc<ContainerImage>> {
        self.image.as_ref()
    }

    pub fn required_files(&self) -> &[PathBuf] {
        &self.required_files
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    /// Current inputs, including values resolved from dependencies
    pub fn inputs(&self) -> BTreeMap<String, JsonValue> {
        self.state().inputs.clone()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.state().outcome.clone()
    }

    /// The produced value, once the job has finished
    pub fn result(&self) -> Option<JsonValue> {
        self.state().outcome.as_ref().and_then(|o| o.value().cloned())
    }

    /// The error description, once the job has failed
    pub fn error(&self) -> Option<String> {
        self.state()
            .outcome
            .as_ref()
            .and_then(|o| o.error().map(str::to_string))
    }

    /// Whether the result was served from a cache instead of being executed
    pub fn is_from_cache(&self) -> bool {
        self.state().from_cache
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state().completed_at
    }

    /// Checks whether the job can leave the unsubmitted pool
    ///
    /// Returns `true` once every dependency has finished and the image
    /// requirement, if any, has had its preparation attempted. If a
    /// dependency ended in `Error` the job is failed on the spot and `true` is
    /// returned, so the scheduler removes it without dispatching it.
    pub fn is_ready_to_run(&self) -> bool {
        if self.status() != JobStatus::Queued {
            return self.status().is_terminal();
        }

        for dependency in &self.dependencies {
            match dependency.job.status() {
                JobStatus::Finished => {}
                JobStatus::Error => {
                    let err = self.dependency_error(dependency);
                    debug!("Job {} cannot run: {}", self.name, err);
                    self.fail(err.to_string());
                    return true;
                }
                JobStatus::Queued | JobStatus::Running => return false,
            }
        }

        match &self.image {
            Some(_) => self.state().image_attempted,
            None => true,
        }
    }

    /// Copies each dependency's result into the input it is bound to
    ///
    /// A failed dependency fails this job and is returned as
    /// `KilnError::DependencyFailed`. Dependencies that have not finished
    /// yet are left unbound.
    pub fn resolve_dependent_values(&self) -> Result<()> {
        for dependency in &self.dependencies {
            match dependency.job.outcome() {
                Some(JobOutcome::Finished(value)) => {
                    self.state().inputs.insert(dependency.input.clone(), value);
                }
                Some(JobOutcome::Error(_)) => {
                    let err = self.dependency_error(dependency);
                    self.fail(err.to_string());
                    return Err(err);
                }
                None => {
                    debug!(
                        "Dependency {} of job {} has no result yet",
                        dependency.job.name, self.name
                    );
                }
            }
        }

        Ok(())
    }

    /// Moves the job to `status`
    ///
    /// Terminal statuses set through here carry an empty outcome; handlers
    /// should prefer `finish` and `fail`, which attach one.
    pub fn mark_status(&self, status: JobStatus) -> Result<()> {
        let outcome = match status {
            JobStatus::Finished => Some(JobOutcome::Finished(JsonValue::Null)),
            JobStatus::Error => Some(JobOutcome::Error(format!("Job {} marked as failed", self.name))),
            JobStatus::Queued | JobStatus::Running => None,
        };

        self.transition(status, outcome, false)
    }

    /// Records a successful result
    pub fn finish(&self, value: JsonValue) -> Result<()> {
        self.transition(JobStatus::Finished, Some(JobOutcome::Finished(value)), false)
    }

    /// Records a failure
    ///
    /// Failing a job that already reached a terminal state is ignored with a
    /// warning; the first outcome wins.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        if let Err(e) = self.transition(JobStatus::Error, Some(JobOutcome::Error(message)), false) {
            warn!("Ignoring failure of job {}: {}", self.name, e);
        }
    }

    /// Computes the cache key from the current inputs
    pub fn fingerprint(&self) -> Fingerprint {
        let inputs = self.inputs();
        let image = self.image.as_ref().map(|image| image.reference().to_string());
        Fingerprint::compute(&self.name, &self.command, &inputs, image.as_deref())
    }

    pub(crate) fn finish_from_cache(&self, value: JsonValue) -> Result<()> {
        self.transition(JobStatus::Finished, Some(JobOutcome::Finished(value)), true)
    }

    pub(crate) fn mark_image_attempted(&self) {
        self.state().image_attempted = true;
    }

    fn transition(&self, next: JobStatus, outcome: Option<JobOutcome>, from_cache: bool) -> Result<()> {
        let mut state = self.state();

        if !state.status.can_transition_to(next) {
            return Err(KilnError::InvalidTransition {
                from: state.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running {
            state.started_at = Some(now);
        }
        if next.is_terminal() {
            state.completed_at = Some(now);
            state.outcome = outcome;
            state.from_cache = from_cache;
        }
        state.status = next;

        Ok(())
    }

    fn dependency_error(&self, dependency: &Dependency) -> KilnError {
        KilnError::DependencyFailed {
            job: self.name.clone(),
            dependency: dependency.job.name.clone(),
            reason: dependency
                .job
                .error()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handler", &self.handler.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for [`Job`]
pub struct JobBuilder {
    name: String,
    handler: Arc<dyn JobHandler>,
    command: Vec<String>,
    inputs: BTreeMap<String, JsonValue>,
    dependencies: Vec<Dependency>,
    cache: Option<Arc<dyn JobCache>>,
    image: Option<Arc<ContainerImage>>,
    required_files: Vec<PathBuf>,
}

impl JobBuilder {
    /// Sets the program and arguments to execute
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a static input
    pub fn input(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Binds `input` to the result of `job`
    pub fn depends_on(mut self, input: impl Into<String>, job: &Arc<Job>) -> Self {
        self.dependencies.push(Dependency {
            input: input.into(),
            job: Arc::clone(job),
        });
        self
    }

    pub fn cache(mut self, cache: Arc<dyn JobCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn image(mut self, image: Arc<ContainerImage>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn required_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_files.push(path.into());
        self
    }

    pub fn build(self) -> Arc<Job> {
        Arc::new(Job {
            id: Uuid::new_v4(),
            name: self.name,
            command: self.command,
            dependencies: self.dependencies,
            handler: self.handler,
            cache: self.cache,
            image: self.image,
            required_files: self.required_files,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                inputs: self.inputs,
                outcome: None,
                from_cache: false,
                image_attempted: false,
                started_at: None,
                completed_at: None,
            }),
        })
    }
}
