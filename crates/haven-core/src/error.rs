//! Error types for Haven

use thiserror::Error;

use crate::{BackupId, CheckpointId, ConflictId, OverrideId};

/// Resilience engine errors
#[derive(Error, Debug)]
pub enum ResilienceError {
    // Rejected before any mutation
    #[error("Validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Crisis safety violation: {0}")]
    CrisisSafetyViolation(String),

    // Absorbed at the engine edge, surfaced for diagnostics
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Corruption detected in fields {0:?}")]
    CorruptionDetected(Vec<String>),

    #[error("Conflict {id:?} unresolved: {reason}")]
    ConflictUnresolved { id: ConflictId, reason: String },

    // Payload errors
    #[error("Encryption failure: {0}")]
    Encryption(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    // Lookup errors
    #[error("Checkpoint not found: {0:?}")]
    CheckpointNotFound(CheckpointId),

    #[error("Backup not found: {0:?}")]
    BackupNotFound(BackupId),

    #[error("Conflict not found: {0:?}")]
    ConflictNotFound(ConflictId),

    #[error("Override not found: {0:?}")]
    OverrideNotFound(OverrideId),
}

impl ResilienceError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ResilienceError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Safety violations are never retried or coerced
    pub fn is_safety_violation(&self) -> bool {
        matches!(self, ResilienceError::CrisisSafetyViolation(_))
    }
}

/// Result type for Haven operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;
