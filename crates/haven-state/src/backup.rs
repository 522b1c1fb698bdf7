//! Full-state backups
//!
//! Backups have their own retention horizon, independent of checkpoint
//! pruning. An encrypted backup seals its metadata together with the state
//! so it can be re-imported from the store alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use haven_core::{
    AccountState, BackupId, IdSequence, ResilienceError, ResilienceResult, Revision, Timestamp,
};
use haven_crypto::{Checksum, EncryptionAdapter, SealedPayload};

use crate::CorruptionDetector;

/// Backup metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub size: usize,
    pub encrypted: bool,
    pub created_at: Timestamp,
    pub revision: Revision,
    /// Checksum of the serialized state
    pub checksum: Checksum,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupRecord {
    backup: Backup,
    state: AccountState,
}

#[derive(Clone, Debug)]
enum BackupPayload {
    Sealed(SealedPayload),
    /// Memory-only
    Plain(AccountState),
}

/// Outcome of a restore
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub restored_state: Option<AccountState>,
    pub validation_errors: Vec<String>,
    pub data_loss: bool,
}

impl RestoreResult {
    fn failed(errors: Vec<String>) -> Self {
        RestoreResult {
            success: false,
            restored_state: None,
            validation_errors: errors,
            data_loss: false,
        }
    }
}

/// In-memory backup index
#[derive(Debug)]
pub struct BackupManager {
    backups: BTreeMap<BackupId, (Backup, BackupPayload)>,
    ids: IdSequence,
    max_backups: usize,
    detector: CorruptionDetector,
}

impl BackupManager {
    pub fn new(max_backups: usize) -> Self {
        BackupManager {
            backups: BTreeMap::new(),
            ids: IdSequence::new(),
            max_backups: max_backups.max(1),
            detector: CorruptionDetector::new(),
        }
    }

    pub fn create(
        &mut self,
        adapter: &dyn EncryptionAdapter,
        state: &AccountState,
        encrypt: bool,
        now: Timestamp,
        revision: Revision,
    ) -> ResilienceResult<Backup> {
        let body =
            serde_json::to_vec(state).map_err(|e| ResilienceError::Serialization(e.to_string()))?;
        let mut backup = Backup {
            id: BackupId::new(self.ids.take()),
            size: body.len(),
            encrypted: encrypt,
            created_at: now,
            revision,
            checksum: adapter.hash(&body),
        };

        let payload = if encrypt {
            let record = BackupRecord {
                backup: backup.clone(),
                state: state.clone(),
            };
            let sealed = SealedPayload::seal(adapter, &record)?;
            backup.size = sealed.size();
            BackupPayload::Sealed(sealed)
        } else {
            BackupPayload::Plain(state.clone())
        };

        tracing::info!(backup = ?backup.id, encrypted = encrypt, ?revision, "backup created");
        self.backups.insert(backup.id, (backup.clone(), payload));
        Ok(backup)
    }

    /// Re-import an encrypted backup read back from the store
    pub fn import(&mut self, adapter: &dyn EncryptionAdapter, blob: Vec<u8>) -> ResilienceResult<Backup> {
        let sealed = SealedPayload::from_blob(adapter, blob)?;
        let record: BackupRecord = sealed.open(adapter)?;
        self.ids.observe(record.backup.id.value());
        let mut backup = record.backup;
        backup.size = sealed.size();
        self.backups
            .insert(backup.id, (backup.clone(), BackupPayload::Sealed(sealed)));
        Ok(backup)
    }

    /// Encrypted blob for durable storage. `None` for memory-only backups.
    pub fn sealed_blob(&self, id: BackupId) -> Option<&[u8]> {
        match self.backups.get(&id) {
            Some((_, BackupPayload::Sealed(sealed))) => Some(sealed.blob()),
            _ => None,
        }
    }

    pub fn get(&self, id: BackupId) -> Option<&Backup> {
        self.backups.get(&id).map(|(b, _)| b)
    }

    pub fn contains(&self, id: BackupId) -> bool {
        self.backups.contains_key(&id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Backup> {
        self.backups.values().map(|(b, _)| b)
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.list().map(|b| b.size).sum()
    }

    /// Decrypt, verify and optionally validate a backup.
    ///
    /// `latest_checkpoint` is the newest revision any checkpoint captured;
    /// restoring an older backup reports data loss.
    pub fn restore(
        &self,
        id: BackupId,
        adapter: &dyn EncryptionAdapter,
        validate: bool,
        latest_checkpoint: Option<Revision>,
    ) -> ResilienceResult<RestoreResult> {
        let (backup, payload) = self.backups.get(&id).ok_or(ResilienceError::BackupNotFound(id))?;

        let state = match payload {
            BackupPayload::Plain(state) => state.clone(),
            BackupPayload::Sealed(sealed) => match sealed.open::<BackupRecord>(adapter) {
                Ok(record) => record.state,
                Err(e) => {
                    tracing::warn!(backup = ?id, error = %e, "backup payload unreadable");
                    return Ok(RestoreResult::failed(vec![e.to_string()]));
                }
            },
        };

        let body =
            serde_json::to_vec(&state).map_err(|e| ResilienceError::Serialization(e.to_string()))?;
        if adapter.hash(&body) != backup.checksum {
            return Ok(RestoreResult::failed(vec![
                ResilienceError::ChecksumMismatch.to_string()
            ]));
        }

        let validation_errors: Vec<String> = self
            .detector
            .findings(&state)
            .into_iter()
            .map(|f| format!("{}: {}", f.field, f.detail))
            .collect();
        if validate && !validation_errors.is_empty() {
            return Ok(RestoreResult::failed(validation_errors));
        }

        Ok(RestoreResult {
            success: true,
            restored_state: Some(state),
            validation_errors,
            data_loss: latest_checkpoint.map_or(false, |rev| backup.revision < rev),
        })
    }

    /// Drop the oldest backups beyond the retention horizon
    pub fn enforce_retention(&mut self) -> Vec<BackupId> {
        let excess = self.backups.len().saturating_sub(self.max_backups);
        let doomed: Vec<BackupId> = self.backups.keys().take(excess).copied().collect();
        for id in &doomed {
            self.backups.remove(id);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.backups.clear();
    }

    #[doc(hidden)]
    pub fn corrupt_payload(&mut self, id: BackupId) {
        if let Some((_, BackupPayload::Sealed(sealed))) = self.backups.get_mut(&id) {
            let mid = sealed.blob().len() / 2;
            sealed.blob_mut()[mid] ^= 0xff;
        }
    }
}
