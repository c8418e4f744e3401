//! Job manager
//!
//! Owns the two job pools and drives jobs through them. `iterate` performs one
//! non-blocking scheduling pass:
//! 1. Prune: drop unsubmitted jobs that failed before dispatch
//! 2. Submit: move ready jobs to the submitted pool, answering them from the
//!    cache or dispatching them to their handler
//! 3. Review: retire terminal submitted jobs and poll the handlers that still
//!    own outstanding work
//!
//! `wait` repeats passes with a short pause until both pools drain.

use kiln_core::KilnError;
use kiln_core::domain::job::{Fingerprint, JobStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::handler::{JobHandler, handler_key};
use crate::job::Job;
use crate::staging::InputStager;

/// Default pause between passes in `wait`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Unsubmitted jobs dropped because they already failed
    pub pruned: usize,
    /// Jobs handed to a handler
    pub dispatched: usize,
    /// Jobs answered from a cache
    pub cache_hits: usize,
    /// Ready jobs held back behind an in-flight job with the same fingerprint
    pub deferred: usize,
    /// Submitted jobs retired as finished
    pub finished: usize,
    /// Submitted jobs retired as failed
    pub errored: usize,
    /// Distinct handlers polled
    pub handlers_polled: usize,
}

/// Single-threaded cooperative job scheduler
///
/// Every job is in at most one pool at a time: `unsubmitted` until it is
/// ready, then `submitted` until it reaches a terminal status.
pub struct JobManager {
    unsubmitted: Vec<Arc<Job>>,
    submitted: Vec<Arc<Job>>,
    tracked: HashSet<Uuid>,
    in_flight: HashMap<Fingerprint, Uuid>,
    stager: Option<Arc<dyn InputStager>>,
    poll_interval: Duration,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            unsubmitted: Vec::new(),
            submitted: Vec::new(),
            tracked: HashSet::new(),
            in_flight: HashMap::new(),
            stager: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Stages job inputs during `queue_job`
    pub fn with_stager(mut self, stager: Arc<dyn InputStager>) -> Self {
        self.stager = Some(stager);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn unsubmitted_len(&self) -> usize {
        self.unsubmitted.len()
    }

    pub fn submitted_len(&self) -> usize {
        self.submitted.len()
    }

    /// Whether both pools are empty
    pub fn is_empty(&self) -> bool {
        self.unsubmitted.is_empty() && self.submitted.is_empty()
    }

    /// Whether the job is waiting to be submitted
    pub fn is_unsubmitted(&self, job_id: Uuid) -> bool {
        self.unsubmitted.iter().any(|job| job.id() == job_id)
    }

    /// Whether the job is dispatched and not yet retired
    pub fn is_submitted(&self, job_id: Uuid) -> bool {
        self.submitted.iter().any(|job| job.id() == job_id)
    }

    /// Adds a newly built job to the unsubmitted pool
    ///
    /// Stages the job's inputs and prepares its image first. A failure in
    /// either marks the job `Error` and keeps it out of the pools. Jobs whose
    /// dependencies are unresolved are accepted; readiness is checked by
    /// `iterate`. Jobs already tracked, or no longer `Queued`, are ignored.
    pub fn queue_job(&mut self, job: Arc<Job>) {
        if self.tracked.contains(&job.id()) {
            warn!("Job {} ({}) is already queued", job.name(), job.id());
            return;
        }
        if job.status() != JobStatus::Queued {
            warn!(
                "Job {} cannot be queued from status {}",
                job.name(),
                job.status()
            );
            return;
        }

        if let Some(stager) = &self.stager {
            if let Err(e) = stager.stage(&job) {
                error!("Failed to stage inputs of job {}: {:#}", job.name(), e);
                job.fail(KilnError::Staging(format!("{:#}", e)).to_string());
                return;
            }
        }

        if let Some(image) = job.image() {
            if let Err(e) = image.prepare() {
                error!("Failed to prepare image for job {}: {}", job.name(), e);
                job.fail(e.to_string());
                return;
            }
            job.mark_image_attempted();
        }

        info!("Queued job {} ({})", job.name(), job.id());
        self.tracked.insert(job.id());
        self.unsubmitted.push(job);
    }

    /// Forgets every job without notifying handlers
    pub fn reset(&mut self) {
        debug!(
            "Resetting job manager ({} unsubmitted, {} submitted)",
            self.unsubmitted.len(),
            self.submitted.len()
        );
        self.unsubmitted.clear();
        self.submitted.clear();
        self.tracked.clear();
        self.in_flight.clear();
    }

    /// Runs one scheduling pass
    pub fn iterate(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        self.prune(&mut summary);
        self.submit(&mut summary);
        self.review(&mut summary);

        if summary != PassSummary::default() {
            debug!("Scheduling pass: {:?}", summary);
        }
        summary
    }

    /// Repeats `iterate` until both pools drain or `timeout` elapses
    ///
    /// `None` waits for as long as it takes; a zero timeout returns right
    /// after the first pass. Returns whether the pools drained. Timing out
    /// leaves jobs where they are; a later call resumes them.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> bool {
        self.wait_with_cancel(timeout, &CancellationToken::new()).await
    }

    /// Like `wait`, but also returns early once `cancel` is cancelled
    ///
    /// Cancellation only stops waiting; outstanding jobs keep running.
    pub async fn wait_with_cancel(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            self.iterate();
            if self.is_empty() {
                return true;
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(
                            "Wait timed out with {} unsubmitted and {} submitted job(s)",
                            self.unsubmitted.len(),
                            self.submitted.len()
                        );
                        return false;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Wait cancelled");
                    return false;
                }
                _ = time::sleep(pause) => {}
            }
        }
    }

    fn prune(&mut self, summary: &mut PassSummary) {
        let tracked = &mut self.tracked;
        self.unsubmitted.retain(|job| {
            if job.status() == JobStatus::Queued {
                return true;
            }
            debug!("Pruning job {} ({})", job.name(), job.status());
            tracked.remove(&job.id());
            summary.pruned += 1;
            false
        });
    }

    fn submit(&mut self, summary: &mut PassSummary) {
        let candidates = std::mem::take(&mut self.unsubmitted);
        let mut waiting = Vec::with_capacity(candidates.len());

        for job in candidates {
            if !job.is_ready_to_run() {
                waiting.push(job);
                continue;
            }

            // Readiness fails jobs whose dependencies failed
            if job.status() == JobStatus::Error {
                info!(
                    "Job {} failed before dispatch: {}",
                    job.name(),
                    job.error().unwrap_or_default()
                );
                self.tracked.remove(&job.id());
                summary.pruned += 1;
                continue;
            }

            if let Err(e) = job.resolve_dependent_values() {
                info!("Job {} failed before dispatch: {}", job.name(), e);
                self.tracked.remove(&job.id());
                summary.pruned += 1;
                continue;
            }

            let fingerprint = job.cache().map(|_| job.fingerprint());
            if let Some(fingerprint) = fingerprint {
                if self.in_flight.contains_key(&fingerprint) {
                    debug!(
                        "Deferring job {}: identical job in flight ({})",
                        job.name(),
                        fingerprint
                    );
                    summary.deferred += 1;
                    waiting.push(job);
                    continue;
                }
            }

            let handler = Arc::clone(job.handler());
            handler.counters().record_total();
            self.submitted.push(Arc::clone(&job));

            if let (Some(cache), Some(fingerprint)) = (job.cache(), fingerprint) {
                if let Some(value) = cache.fetch_cached_result(&job) {
                    match job.finish_from_cache(value) {
                        Ok(()) => {
                            info!("Job {} answered from cache ({})", job.name(), fingerprint);
                            handler.counters().record_skipped();
                            summary.cache_hits += 1;
                        }
                        Err(e) => warn!("Could not apply cached result to {}: {}", job.name(), e),
                    }
                    continue;
                }
                self.in_flight.insert(fingerprint, job.id());
            }

            if let Err(e) = job.mark_status(JobStatus::Running) {
                warn!("Not dispatching job {}: {}", job.name(), e);
                continue;
            }

            info!("Dispatching job {} to {}", job.name(), handler.name());
            handler.counters().record_submitted();
            summary.dispatched += 1;
            handler.dispatch(job);
        }

        self.unsubmitted = waiting;
    }

    fn review(&mut self, summary: &mut PassSummary) {
        let mut handlers: Vec<Arc<dyn JobHandler>> = Vec::new();
        let mut seen = HashSet::new();

        let submitted = std::mem::take(&mut self.submitted);
        for job in submitted {
            let status = job.status();

            if !status.is_terminal() {
                let handler = job.handler();
                if seen.insert(handler_key(handler)) {
                    handlers.push(Arc::clone(handler));
                }
                self.submitted.push(job);
                continue;
            }

            self.tracked.remove(&job.id());
            if let Some(cache) = job.cache() {
                let fingerprint = job.fingerprint();
                if self.in_flight.get(&fingerprint) == Some(&job.id()) {
                    self.in_flight.remove(&fingerprint);
                }
                if !job.is_from_cache() {
                    cache.store_result(&job);
                }
            }

            let counters = job.handler().counters();
            match status {
                JobStatus::Finished => {
                    debug!("Retired finished job {}", job.name());
                    counters.record_finished();
                    summary.finished += 1;
                }
                _ => {
                    info!(
                        "Job {} ended in error: {}",
                        job.name(),
                        job.error().unwrap_or_default()
                    );
                    counters.record_errored();
                    summary.errored += 1;
                }
            }
        }

        for handler in &handlers {
            handler.iterate();
        }
        summary.handlers_polled = handlers.len();
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryJobCache, JobCache};
    use crate::container::testing::{FakeRuntime, provisioning};
    use crate::container::{ContainerImage, RuntimeMode};
    use crate::handler::testing::{InlineHandler, ManualHandler};
    use crate::handler::CounterSnapshot;
    use crate::staging::WorkspaceStager;
    use serde_json::json;

    fn echo_handler() -> Arc<InlineHandler> {
        Arc::new(InlineHandler::echo_inputs())
    }

    #[test]
    fn test_iterate_on_empty_manager() {
        let mut manager = JobManager::new();
        assert_eq!(manager.iterate(), PassSummary::default());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_independent_jobs_finish() {
        let handler = echo_handler();
        let mut manager = JobManager::new().with_poll_interval(Duration::from_millis(5));

        let jobs: Vec<_> = (0..3)
            .map(|i| {
                Job::builder(format!("job-{}", i), handler.clone())
                    .input("i", json!(i))
                    .build()
            })
            .collect();
        for job in &jobs {
            manager.queue_job(job.clone());
        }

        assert!(manager.wait(Some(Duration::from_secs(5))).await);

        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.status(), JobStatus::Finished);
            assert_eq!(job.result(), Some(json!({"i": i})));
            assert!(!manager.is_unsubmitted(job.id()));
            assert!(!manager.is_submitted(job.id()));
        }
        assert_eq!(
            handler.counters().snapshot(),
            CounterSnapshot {
                total: 3,
                submitted: 3,
                skipped: 0,
                finished: 3,
                errored: 0,
            }
        );
    }

    #[test]
    fn test_dependent_runs_after_dependency_with_its_value() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let echo = echo_handler();
        let mut manager = JobManager::new();

        let a = Job::builder("a", manual.clone()).build();
        let b = Job::builder("b", echo.clone()).depends_on("from_a", &a).build();
        manager.queue_job(a.clone());
        manager.queue_job(b.clone());

        let summary = manager.iterate();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(manual.dispatched(), vec!["a"]);
        assert!(echo.dispatched().is_empty());
        assert!(manager.is_submitted(a.id()));
        assert!(manager.is_unsubmitted(b.id()));

        // Still running: nothing moves, handler keeps being polled
        manager.iterate();
        assert!(echo.dispatched().is_empty());
        assert_eq!(manual.iterations(), 2);

        a.finish(json!("payload")).unwrap();
        let summary = manager.iterate();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.finished, 2);
        assert_eq!(echo.dispatched(), vec!["b"]);
        assert_eq!(b.result(), Some(json!({"from_a": "payload"})));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_failed_dependency_is_never_dispatched() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let downstream = Arc::new(ManualHandler::new("downstream"));
        let mut manager = JobManager::new();

        let k = Job::builder("k", manual.clone()).build();
        let j = Job::builder("j", downstream.clone()).depends_on("x", &k).build();
        let grandchild = Job::builder("g", downstream.clone()).depends_on("y", &j).build();
        manager.queue_job(k.clone());
        manager.queue_job(j.clone());
        manager.queue_job(grandchild.clone());

        manager.iterate();
        k.fail("exploded");

        for _ in 0..4 {
            manager.iterate();
        }

        assert_eq!(j.status(), JobStatus::Error);
        assert_eq!(grandchild.status(), JobStatus::Error);
        assert!(j.started_at().is_none());
        assert!(j.error().unwrap().contains("exploded"));
        assert!(downstream.dispatched().is_empty());
        assert!(manager.is_empty());
        assert_eq!(manual.counters().snapshot().errored, 1);
    }

    #[test]
    fn test_prune_removes_jobs_failed_while_unsubmitted() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new();

        let blocker = Job::builder("blocker", manual.clone()).build();
        let job = Job::builder("job", manual.clone())
            .depends_on("x", &blocker)
            .build();
        manager.queue_job(blocker.clone());
        manager.queue_job(job.clone());
        manager.iterate();
        assert!(manager.is_unsubmitted(job.id()));

        job.fail("cancelled by caller");
        let summary = manager.iterate();

        assert_eq!(summary.pruned, 1);
        assert!(!manager.is_unsubmitted(job.id()));
        assert!(manager.is_submitted(blocker.id()));
    }

    #[test]
    fn test_cache_dispatches_identical_jobs_once() {
        let handler = echo_handler();
        let cache: Arc<dyn JobCache> = Arc::new(InMemoryJobCache::new());
        let mut manager = JobManager::new();

        let first = Job::builder("square", handler.clone())
            .input("n", json!(4))
            .cache(cache.clone())
            .build();
        let second = Job::builder("square", handler.clone())
            .input("n", json!(4))
            .cache(cache.clone())
            .build();
        manager.queue_job(first.clone());
        manager.queue_job(second.clone());

        for _ in 0..3 {
            manager.iterate();
        }

        assert!(manager.is_empty());
        assert_eq!(handler.dispatched(), vec!["square"]);
        assert_eq!(first.result(), second.result());
        assert!(second.is_from_cache());
        assert!(!first.is_from_cache());

        let counters = handler.counters().snapshot();
        assert_eq!(counters.submitted, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.total, 2);
    }

    #[test]
    fn test_identical_job_waits_for_in_flight_twin() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let cache: Arc<dyn JobCache> = Arc::new(InMemoryJobCache::new());
        let mut manager = JobManager::new();

        let first = Job::builder("slow", manual.clone()).cache(cache.clone()).build();
        let second = Job::builder("slow", manual.clone()).cache(cache.clone()).build();
        manager.queue_job(first.clone());
        manager.queue_job(second.clone());

        let summary = manager.iterate();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.deferred, 1);
        assert!(manager.is_unsubmitted(second.id()));

        first.finish(json!(99)).unwrap();
        manager.iterate();
        let summary = manager.iterate();

        assert_eq!(summary.cache_hits, 1);
        assert_eq!(second.result(), Some(json!(99)));
        assert_eq!(manual.dispatched(), vec!["slow"]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_failed_twin_is_not_cached() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let cache: Arc<dyn JobCache> = Arc::new(InMemoryJobCache::new());
        let mut manager = JobManager::new();

        let first = Job::builder("flaky", manual.clone()).cache(cache.clone()).build();
        let second = Job::builder("flaky", manual.clone()).cache(cache.clone()).build();
        manager.queue_job(first.clone());
        manager.queue_job(second.clone());
        manager.iterate();

        first.fail("transient");
        manager.iterate();
        manager.iterate();

        // The twin runs for real instead of inheriting the failure
        assert_eq!(manual.dispatched(), vec!["flaky", "flaky"]);
        assert_eq!(second.status(), JobStatus::Running);
    }

    #[test]
    fn test_handler_polled_once_per_pass() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new();

        for i in 0..5 {
            manager.queue_job(Job::builder(format!("job-{}", i), manual.clone()).build());
        }

        let summary = manager.iterate();
        assert_eq!(summary.dispatched, 5);
        assert_eq!(summary.handlers_polled, 1);
        assert_eq!(manual.iterations(), 1);
    }

    #[test]
    fn test_queue_job_ignores_duplicates_and_started_jobs() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new();

        let job = Job::builder("job", manual.clone()).build();
        manager.queue_job(job.clone());
        manager.queue_job(job.clone());
        assert_eq!(manager.unsubmitted_len(), 1);

        let started = Job::builder("started", manual.clone()).build();
        started.mark_status(JobStatus::Running).unwrap();
        manager.queue_job(started);
        assert_eq!(manager.unsubmitted_len(), 1);
    }

    #[test]
    fn test_staging_failure_keeps_job_out_of_pools() {
        let workspaces = tempfile::tempdir().unwrap();
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager =
            JobManager::new().with_stager(Arc::new(WorkspaceStager::new(workspaces.path())));

        let job = Job::builder("load", manual.clone())
            .required_file(workspaces.path().join("missing.csv"))
            .build();
        manager.queue_job(job.clone());

        assert_eq!(job.status(), JobStatus::Error);
        assert!(job.error().unwrap().contains("Input staging failed"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_image_prepared_once_for_shared_image() {
        let primary = Arc::new(FakeRuntime::new("primary"));
        let alternate = Arc::new(FakeRuntime::new("alternate"));
        let image = Arc::new(
            ContainerImage::remote(
                "docker://alpine:3.19",
                None,
                provisioning(RuntimeMode::Primary, &primary, &alternate),
            )
            .unwrap(),
        );
        let handler = echo_handler();
        let mut manager = JobManager::new();

        let a = Job::builder("a", handler.clone()).image(image.clone()).build();
        let b = Job::builder("b", handler.clone()).image(image.clone()).build();
        manager.queue_job(a.clone());
        manager.queue_job(b.clone());
        manager.iterate();

        assert_eq!(primary.pulls(), vec!["alpine:3.19".to_string()]);
        assert_eq!(a.status(), JobStatus::Finished);
        assert_eq!(b.status(), JobStatus::Finished);
    }

    #[test]
    fn test_image_prepare_failure_fails_job() {
        let primary = Arc::new(FakeRuntime::new("primary").failing());
        let alternate = Arc::new(FakeRuntime::new("alternate"));
        let image = Arc::new(
            ContainerImage::remote(
                "alpine",
                None,
                provisioning(RuntimeMode::Primary, &primary, &alternate),
            )
            .unwrap(),
        );
        let handler = echo_handler();
        let mut manager = JobManager::new();

        let job = Job::builder("a", handler.clone()).image(image).build();
        manager.queue_job(job.clone());

        assert_eq!(job.status(), JobStatus::Error);
        assert!(job.error().unwrap().contains("registry unreachable"));
        assert!(manager.is_empty());
        assert!(handler.dispatched().is_empty());
    }

    #[test]
    fn test_reset_clears_pools_without_touching_jobs() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new();

        let a = Job::builder("a", manual.clone()).build();
        let b = Job::builder("b", manual.clone()).depends_on("x", &a).build();
        manager.queue_job(a.clone());
        manager.queue_job(b.clone());
        manager.iterate();

        manager.reset();

        assert!(manager.is_empty());
        assert_eq!(a.status(), JobStatus::Running);
        assert_eq!(b.status(), JobStatus::Queued);

        // A fresh session can track the same job again
        manager.queue_job(b.clone());
        assert_eq!(manager.unsubmitted_len(), 1);
    }

    #[tokio::test]
    async fn test_wait_zero_timeout_returns_after_one_pass() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new();

        let a = Job::builder("a", manual.clone()).build();
        let b = Job::builder("b", manual.clone()).depends_on("x", &a).build();
        let c = Job::builder("c", manual.clone()).depends_on("x", &a).build();
        manager.queue_job(a.clone());
        manager.queue_job(b.clone());
        manager.queue_job(c.clone());

        assert!(!manager.wait(Some(Duration::ZERO)).await);

        assert_eq!(manual.dispatched(), vec!["a"]);
        assert!(manager.is_unsubmitted(b.id()));
        assert!(manager.is_unsubmitted(c.id()));
        assert_eq!(b.status(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_wait_resumes_after_timeout() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new().with_poll_interval(Duration::from_millis(5));

        let a = Job::builder("a", manual.clone()).build();
        manager.queue_job(a.clone());

        assert!(!manager.wait(Some(Duration::from_millis(20))).await);
        assert!(manager.is_submitted(a.id()));

        a.finish(json!(1)).unwrap();
        assert!(manager.wait(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn test_wait_with_cancel_stops_early() {
        let manual = Arc::new(ManualHandler::new("manual"));
        let mut manager = JobManager::new().with_poll_interval(Duration::from_millis(5));
        manager.queue_job(Job::builder("never", manual.clone()).build());

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!manager.wait_with_cancel(None, &cancel).await);
        assert_eq!(manager.submitted_len(), 1);
    }
}
