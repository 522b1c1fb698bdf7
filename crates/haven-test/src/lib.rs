//! Haven Test Harness - Chaos testing and engine validation
//!
//! This crate provides:
//! - A backing store with injected faults
//! - Resilience engine fuzzing
//! - End-to-end recovery, conflict and crisis scenarios

pub mod chaos;
pub mod state_fuzzer;
pub mod integration;

pub use chaos::*;
pub use state_fuzzer::*;
pub use integration::*;
