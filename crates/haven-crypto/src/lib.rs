//! Haven Crypto - Payload protection for checkpoints, backups and journal
//!
//! Provides:
//! - The `EncryptionAdapter` capability
//! - AEAD encryption (ChaCha20-Poly1305) as the default adapter
//! - SHA-256 checksums, including an order-dependent chained form
//! - Sealed envelopes that verify their checksum on every open

pub mod aead;
pub mod adapter;
pub mod checksum;
pub mod envelope;

pub use aead::*;
pub use adapter::*;
pub use checksum::*;
pub use envelope::*;
