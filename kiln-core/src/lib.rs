//! Kiln Core
//!
//! Core types shared by the Kiln job runtime.
//!
//! This crate contains:
//! - Domain types: job status machine, outcomes, fingerprints, image references
//! - DTOs: the job plan format consumed by the runner
//! - Errors: the runtime-wide error taxonomy

pub mod domain;
pub mod dto;
pub mod error;

pub use error::{KilnError, Result};
