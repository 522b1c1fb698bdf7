//! SHA-256 checksums

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-byte content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub const ZERO: Checksum = Checksum([0u8; 32]);

    /// Digest of a byte slice
    pub fn of(data: &[u8]) -> Self {
        Checksum(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Order-dependent checksum over a sequence of items
///
/// Each step hashes the previous digest together with a length-prefixed
/// item, so swapping two items changes the result.
#[derive(Clone, Debug, Default)]
pub struct ChainedChecksum {
    current: Checksum,
    items: usize,
}

impl ChainedChecksum {
    pub fn new() -> Self {
        ChainedChecksum::default()
    }

    pub fn update(&mut self, item: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.current.0);
        hasher.update((item.len() as u64).to_le_bytes());
        hasher.update(item);
        self.current = Checksum(hasher.finalize().into());
        self.items += 1;
    }

    pub fn items(&self) -> usize {
        self.items
    }

    pub fn finalize(&self) -> Checksum {
        self.current
    }
}
