//! Job plan file format
//!
//! A plan is a JSON document listing jobs by name. Dependencies bind one of
//! the dependent job's inputs to the result of another job in the same plan.
//!
//! ```json
//! {
//!   "jobs": [
//!     { "name": "fetch", "command": ["curl", "-s", "https://example.com"] },
//!     {
//!       "name": "count",
//!       "command": ["sh", "-c", "echo \"$KILN_INPUT_PAGE\" | wc -c"],
//!       "dependencies": [{ "input": "page", "job": "fetch" }],
//!       "image": { "source": "remote", "reference": "docker://alpine:3.19" }
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A set of jobs to run together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPlan {
    pub jobs: Vec<PlannedJob>,
}

/// A single job entry in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedJob {
    /// Unique name within the plan
    pub name: String,
    /// Program and arguments to execute
    pub command: Vec<String>,
    /// Static inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, JsonValue>,
    /// Inputs filled from other jobs' results, in order
    #[serde(default)]
    pub dependencies: Vec<DependencyBinding>,
    /// Container image the job runs in
    #[serde(default)]
    pub image: Option<PlannedImage>,
    /// Files staged into the job workspace before it may run
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
    /// Whether results are looked up in and stored to the cache
    #[serde(default = "default_cache")]
    pub cache: bool,
}

/// Binds an input of the dependent job to another job's result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyBinding {
    pub input: String,
    pub job: String,
}

/// Image requirement of a planned job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum PlannedImage {
    /// Built on this machine
    Local {
        reference: String,
        #[serde(default)]
        tag: Option<String>,
    },
    /// Pulled from a registry
    Remote {
        reference: String,
        #[serde(default)]
        tag: Option<String>,
    },
}

fn default_cache() -> bool {
    true
}
