//! File-backed result cache
//!
//! Each result lives in `<dir>/<fingerprint>.json`. Writes go through a
//! temporary file and a rename so readers never see a partial record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_core::domain::job::Fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::JobCache;
use crate::job::Job;

/// On-disk cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    fingerprint: Fingerprint,
    job_name: String,
    stored_at: DateTime<Utc>,
    result: JsonValue,
}

/// Cache persisted as one JSON file per fingerprint
#[derive(Debug, Clone)]
pub struct DirectoryJobCache {
    dir: PathBuf,
}

impl DirectoryJobCache {
    /// Opens a cache rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint))
    }

    fn read(&self, fingerprint: Fingerprint) -> Result<Option<CacheRecord>> {
        let path = self.path_for(fingerprint);
        if !path.exists() {
            return Ok(None);
        }

        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt cache record {}", path.display()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &CacheRecord) -> Result<()> {
        let path = self.path_for(record.fingerprint);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(record).context("Failed to serialize record")?;
        fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move record into {}", path.display()))?;
        Ok(())
    }
}

impl JobCache for DirectoryJobCache {
    fn fetch_cached_result(&self, job: &Job) -> Option<JsonValue> {
        let fingerprint = job.fingerprint();
        match self.read(fingerprint) {
            Ok(Some(record)) => {
                debug!(
                    "Cache hit for job {} ({}), stored by {} at {}",
                    job.name(),
                    fingerprint,
                    record.job_name,
                    record.stored_at
                );
                Some(record.result)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable cache entry for job {}: {:#}", job.name(), e);
                None
            }
        }
    }

    fn store_result(&self, job: &Job) {
        let Some(result) = job.result() else {
            return;
        };

        let record = CacheRecord {
            fingerprint: job.fingerprint(),
            job_name: job.name().to_string(),
            stored_at: Utc::now(),
            result,
        };

        if let Err(e) = self.write(&record) {
            warn!("Failed to cache result of job {}: {:#}", job.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::JobHandler;
    use crate::handler::testing::ManualHandler;
    use serde_json::json;
    use std::sync::Arc;

    fn handler() -> Arc<dyn JobHandler> {
        Arc::new(ManualHandler::new("manual"))
    }

    #[test]
    fn test_results_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let job = Job::builder("a", handler()).command(["true"]).build();
        job.finish(json!({"rows": 3})).unwrap();
        DirectoryJobCache::open(dir.path()).unwrap().store_result(&job);

        let reopened = DirectoryJobCache::open(dir.path()).unwrap();
        let twin = Job::builder("a", handler()).command(["true"]).build();
        assert_eq!(reopened.fetch_cached_result(&twin), Some(json!({"rows": 3})));
    }

    #[test]
    fn test_record_file_is_named_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryJobCache::open(dir.path()).unwrap();

        let job = Job::builder("a", handler()).build();
        job.finish(json!(1)).unwrap();
        cache.store_result(&job);

        let expected = dir.path().join(format!("{}.json", job.fingerprint()));
        assert!(expected.exists());
    }

    #[test]
    fn test_failed_jobs_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryJobCache::open(dir.path()).unwrap();

        let job = Job::builder("a", handler()).build();
        job.fail("nope");
        cache.store_result(&job);

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryJobCache::open(dir.path()).unwrap();

        let job = Job::builder("a", handler()).build();
        fs::write(cache.path_for(job.fingerprint()), b"not json").unwrap();

        assert!(cache.fetch_cached_result(&job).is_none());
    }
}
