//! Data transfer objects
//!
//! Serialized formats read by the runner.

pub mod plan;
