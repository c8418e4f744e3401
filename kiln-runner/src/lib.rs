//! Kiln Runner
//!
//! Schedules interdependent jobs on a single machine.
//!
//! Architecture:
//! - Jobs: units of work with inputs, dependencies and a lifecycle
//! - Handlers: execution backends jobs are dispatched to
//! - Caches: results keyed by job fingerprint
//! - Containers: image provisioning through a primary or alternate runtime
//! - Staging: per-job workspaces holding required files
//! - Scheduler: the job manager driving jobs from queued to terminal
//! - Plans: JSON job graphs turned into wired jobs

pub mod cache;
pub mod config;
pub mod container;
pub mod handler;
pub mod job;
pub mod plan;
pub mod scheduler;
pub mod staging;

pub use config::Config;
pub use job::Job;
pub use scheduler::{JobManager, PassSummary};
