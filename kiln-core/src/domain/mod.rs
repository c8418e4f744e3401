//! Core domain types
//!
//! Shared between the scheduler (which drives job lifecycles) and the
//! handlers and caches plugged into it.

pub mod image;
pub mod job;
