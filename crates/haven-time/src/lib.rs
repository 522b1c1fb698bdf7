//! Haven Time - Clock capability and latency tracking
//!
//! This crate implements:
//! - The `Clock` capability (wall clock, manual clock for tests)
//! - Monotonic latency measurement against per-operation targets

pub mod clock;
pub mod latency;

pub use clock::*;
pub use latency::*;
