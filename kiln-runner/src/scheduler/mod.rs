//! Scheduler layer
//!
//! Tracks queued jobs, decides when each becomes eligible to run, and hands
//! eligible jobs to their handlers or answers them from a cache.

pub mod manager;

pub use manager::{DEFAULT_POLL_INTERVAL, JobManager, PassSummary};
