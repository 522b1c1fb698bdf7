//! Haven Store - Durable persistence and device propagation capabilities
//!
//! This crate provides:
//! - The async `BackingStore` capability (get/set/remove, all fallible)
//! - Key layout and blob encoding for stored payloads
//! - An in-memory store
//! - The async `DeviceSync` capability for tier propagation

pub mod backing;
pub mod keys;
pub mod memory;
pub mod device;

pub use backing::*;
pub use keys::*;
pub use memory::*;
pub use device::*;
