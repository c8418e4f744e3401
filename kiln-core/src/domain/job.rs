//! Job domain types

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Job lifecycle status
///
/// `Queued -> Running -> Finished | Error`. A queued job may also go straight
/// to `Finished` (cache hit) or `Error` (failed dependency or staging).
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    /// Whether the job has stopped for good
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Finished)
                | (Queued, Error)
                | (Running, Finished)
                | (Running, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Terminal outcome of a job, populated exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// The value the job produced
    Finished(JsonValue),
    /// Description of why the job failed
    Error(String),
}

impl JobOutcome {
    /// Status matching this outcome
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Finished(_) => JobStatus::Finished,
            JobOutcome::Error(_) => JobStatus::Error,
        }
    }

    /// The produced value, if the job finished
    pub fn value(&self) -> Option<&JsonValue> {
        match self {
            JobOutcome::Finished(value) => Some(value),
            JobOutcome::Error(_) => None,
        }
    }

    /// The error description, if the job failed
    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Finished(_) => None,
            JobOutcome::Error(message) => Some(message),
        }
    }
}

/// Cache key derived from everything that determines a job's result
///
/// Two jobs with the same name, command, resolved inputs and image share a
/// fingerprint. The dependency graph itself is not part of the key: only the
/// values dependencies contributed to the inputs are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the fingerprint of a job description
    pub fn compute(
        name: &str,
        command: &[String],
        inputs: &BTreeMap<String, JsonValue>,
        image: Option<&str>,
    ) -> Self {
        // serde_json maps are ordered, so this rendering is canonical
        let canonical = serde_json::json!({
            "name": name,
            "command": command,
            "inputs": inputs,
            "image": image,
        })
        .to_string();

        Fingerprint(xxh3_64(canonical.as_bytes()))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
