//! Haven Runtime - Resilience engine orchestration
//!
//! This crate wires the state components into one engine:
//! - `ResilienceEngine`, the context object exposing every async operation
//! - Configuration with defaults and JSON loading
//! - Background validation on a tokio task with a stop handle
//! - Write-behind persistence with bounded store calls
//! - Diagnostics snapshots and health counters
//! - Structured logging setup

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod logging;
pub mod scheduler;
mod writeback;

pub use config::*;
pub use diagnostics::*;
pub use engine::*;
pub use logging::*;
pub use scheduler::*;
