//! Store key layout and blob encoding
//!
//! Every stored value is an opaque encrypted blob, base64 encoded, keyed by
//! `<prefix><id>`.

use std::fmt::Display;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::{StoreError, StoreResult};

pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
pub const BACKUP_PREFIX: &str = "backup_";
pub const UPDATE_PREFIX: &str = "update_";
pub const OVERRIDE_PREFIX: &str = "override_";

/// Kind of stored record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Checkpoint,
    Backup,
    Update,
    Override,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Checkpoint => CHECKPOINT_PREFIX,
            RecordKind::Backup => BACKUP_PREFIX,
            RecordKind::Update => UPDATE_PREFIX,
            RecordKind::Override => OVERRIDE_PREFIX,
        }
    }

    /// Full store key for an id
    pub fn key(&self, id: impl Display) -> String {
        format!("{}{}", self.prefix(), id)
    }
}

/// Encode an encrypted blob as a store value
pub fn encode_blob(blob: &[u8]) -> String {
    STANDARD.encode(blob)
}

/// Decode a store value back into the encrypted blob
pub fn decode_blob(key: &str, value: &str) -> StoreResult<Vec<u8>> {
    STANDARD.decode(value).map_err(|e| {
        tracing::warn!(%key, error = %e, "stored value is not base64");
        StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::CheckpointId;

    #[test]
    fn test_keys_use_prefixes() {
        assert_eq!(
            RecordKind::Checkpoint.key(CheckpointId::new(1)),
            "checkpoint_00000001"
        );
        assert!(RecordKind::Backup.key(3).starts_with("backup_"));
        assert!(RecordKind::Update.key(3).starts_with("update_"));
    }

    #[test]
    fn test_blob_encoding() {
        let blob = vec![0u8, 1, 2, 254, 255];
        let encoded = encode_blob(&blob);
        assert_eq!(decode_blob("k", &encoded).unwrap(), blob);
        assert!(matches!(
            decode_blob("k", "not base64!!"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
