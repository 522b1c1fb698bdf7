//! Haven State Engine - Account-state resilience components
//!
//! This crate implements the synchronous core of the resilience engine:
//! - Checkpoint management
//! - Corruption detection
//! - Recovery planning
//! - Cross-device conflict detection and resolution
//! - Incremental update journal and write ledger
//! - Backups
//! - History compression and memory eviction
//! - The crisis safety plane
//!
//! Durable I/O and scheduling live in `haven-runtime`; everything here is
//! in-memory and deterministic given its inputs.

pub mod checkpoint;
pub mod corruption;
pub mod recovery;
pub mod conflict;
pub mod journal;
pub mod backup;
pub mod performance;
pub mod crisis;

pub use checkpoint::*;
pub use corruption::*;
pub use recovery::*;
pub use conflict::*;
pub use journal::*;
pub use backup::*;
pub use performance::*;
pub use crisis::*;
