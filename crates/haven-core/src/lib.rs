//! Haven Core - Fundamental types for the account-state resilience engine
//!
//! This crate defines the types shared by every other Haven crate:
//! - Identifiers (CheckpointId, BackupId, OverrideId, DeviceId, Revision)
//! - Wall-clock timestamps
//! - Account state, tagged field values and the field schema
//! - Crisis overrides
//! - The resilience error taxonomy

pub mod id;
pub mod time;
pub mod value;
pub mod schema;
pub mod account;
pub mod crisis;
pub mod error;

pub use id::*;
pub use time::*;
pub use value::*;
pub use schema::*;
pub use account::*;
pub use crisis::*;
pub use error::*;
