//! Result caches
//!
//! A cache maps a job fingerprint to the value a previous job with the same
//! fingerprint produced. The scheduler consults it before dispatching a job
//! and writes to it once the job finishes.

pub mod directory;

use kiln_core::domain::job::Fingerprint;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::job::Job;

pub use directory::DirectoryJobCache;

/// Storage for finished job results
pub trait JobCache: Send + Sync {
    /// Looks up a previous result for the job's fingerprint
    fn fetch_cached_result(&self, job: &Job) -> Option<JsonValue>;

    /// Stores the result of a terminal job
    ///
    /// Jobs that ended in `Error` are not stored.
    fn store_result(&self, job: &Job);
}

/// Process-local cache
#[derive(Debug, Default)]
pub struct InMemoryJobCache {
    entries: Mutex<HashMap<Fingerprint, JsonValue>>,
}

impl InMemoryJobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, JsonValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobCache for InMemoryJobCache {
    fn fetch_cached_result(&self, job: &Job) -> Option<JsonValue> {
        let fingerprint = job.fingerprint();
        let hit = self.entries().get(&fingerprint).cloned();
        debug!(
            "Cache {} for job {} ({})",
            if hit.is_some() { "hit" } else { "miss" },
            job.name(),
            fingerprint
        );
        hit
    }

    fn store_result(&self, job: &Job) {
        if let Some(value) = job.result() {
            self.entries().insert(job.fingerprint(), value);
        }
    }
}
