//! Job handlers
//!
//! A handler is the execution backend a job is dispatched to. The scheduler
//! only hands ready jobs over and polls the handler once per pass; the handler
//! is responsible for eventually finishing or failing every job it accepts.

pub mod process;

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::job::Job;

pub use process::ProcessHandler;

/// Execution backend for ready jobs
pub trait JobHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Accepts a ready job, already marked `Running`
    ///
    /// Execution may happen synchronously or in the background, but must end
    /// with `Job::finish` or `Job::fail`.
    fn dispatch(&self, job: Arc<Job>);

    /// Called once per scheduler pass while this handler owns outstanding jobs
    ///
    /// Must not block.
    fn iterate(&self) {}

    /// Observability counters, updated by the scheduler
    fn counters(&self) -> &HandlerCounters;
}

/// Per-handler job counters
///
/// Atomic so the scheduler can update them while handler threads read them.
#[derive(Debug, Default)]
pub struct HandlerCounters {
    total: AtomicU64,
    submitted: AtomicU64,
    skipped: AtomicU64,
    finished: AtomicU64,
    errored: AtomicU64,
}

/// Point-in-time copy of [`HandlerCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub submitted: u64,
    pub skipped: u64,
    pub finished: u64,
    pub errored: u64,
}

impl HandlerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A job left the unsubmitted pool for this handler
    pub fn record_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was dispatched to this handler
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was answered from the cache
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }
}

/// Identity of a handler, for deduplicating handlers shared by many jobs
pub(crate) fn handler_key(handler: &Arc<dyn JobHandler>) -> *const () {
    Arc::as_ptr(handler) as *const ()
}
