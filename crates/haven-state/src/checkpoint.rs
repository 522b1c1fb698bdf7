//! Checkpoint management
//!
//! Checkpoints are encrypted snapshots of the whole account state. The
//! in-memory index is authoritative; durable copies are written by the
//! runtime and only read back when a payload was evicted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use haven_core::{
    AccountState, CheckpointId, IdSequence, ResilienceError, ResilienceResult, Revision, Timestamp,
};
use haven_crypto::{Checksum, EncryptionAdapter, SealedPayload};

use crate::CorruptionDetector;

/// What triggered a checkpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Manual,
    IncrementalUpdate,
    ConflictResolution,
    Recovery,
    CrisisActivation,
    Restore,
    Scheduled,
}

/// Caller-supplied checkpoint context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointContext {
    pub operation_type: OperationType,
    pub operation_id: String,
    pub crisis_mode: bool,
}

impl CheckpointContext {
    pub fn new(operation_type: OperationType, operation_id: impl Into<String>) -> Self {
        CheckpointContext {
            operation_type,
            operation_id: operation_id.into(),
            crisis_mode: false,
        }
    }

    pub fn in_crisis(mut self, crisis_mode: bool) -> Self {
        self.crisis_mode = crisis_mode;
        self
    }
}

/// Checkpoint metadata, kept in clear beside the encrypted payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub operation_type: OperationType,
    pub operation_id: String,
    pub crisis_mode: bool,
    /// Snapshot holds an installed crisis override
    pub carries_override: bool,
    pub timestamp: Timestamp,
    pub revision: Revision,
}

/// Encrypted state snapshot
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub metadata: CheckpointMetadata,
    pub checksum: Checksum,
    pub size: usize,
    /// A durable copy exists in the backing store
    pub persisted: bool,
    payload: Option<SealedPayload>,
}

impl Checkpoint {
    /// Payload is held in memory
    pub fn is_resident(&self) -> bool {
        self.payload.is_some()
    }

    pub fn payload(&self) -> Option<&SealedPayload> {
        self.payload.as_ref()
    }

    /// Whether restoring this checkpoint can bring back crisis safety
    pub fn retains_crisis_safety(&self) -> bool {
        self.metadata.carries_override
    }

    #[doc(hidden)]
    pub fn payload_mut(&mut self) -> Option<&mut SealedPayload> {
        self.payload.as_mut()
    }
}

/// Result of a create call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedCheckpoint {
    pub id: CheckpointId,
    /// False when an identical checkpoint already existed
    pub created: bool,
    pub clean: bool,
}

/// In-memory checkpoint index
#[derive(Debug, Default)]
pub struct CheckpointManager {
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
    last_known_good: Option<CheckpointId>,
    ids: IdSequence,
    detector: CorruptionDetector,
}

impl CheckpointManager {
    pub fn new() -> Self {
        CheckpointManager {
            checkpoints: BTreeMap::new(),
            last_known_good: None,
            ids: IdSequence::new(),
            detector: CorruptionDetector::new(),
        }
    }

    /// Snapshot `state`. Retrying with the same context and state returns
    /// the existing checkpoint.
    pub fn create(
        &mut self,
        adapter: &dyn EncryptionAdapter,
        state: &AccountState,
        ctx: &CheckpointContext,
        now: Timestamp,
        revision: Revision,
    ) -> ResilienceResult<CreatedCheckpoint> {
        let payload = SealedPayload::seal(adapter, state)?;
        let checksum = payload.checksum();

        if let Some(existing) = self.checkpoints.values().find(|c| {
            c.checksum == checksum
                && c.metadata.operation_type == ctx.operation_type
                && c.metadata.operation_id == ctx.operation_id
        }) {
            return Ok(CreatedCheckpoint {
                id: existing.id,
                created: false,
                clean: self.last_known_good == Some(existing.id),
            });
        }

        let id = CheckpointId::new(self.ids.take());
        let clean = self.detector.is_clean(state);
        let checkpoint = Checkpoint {
            id,
            metadata: CheckpointMetadata {
                operation_type: ctx.operation_type,
                operation_id: ctx.operation_id.clone(),
                crisis_mode: ctx.crisis_mode || state.crisis_mode(),
                carries_override: state.crisis_override().is_some(),
                timestamp: now,
                revision,
            },
            checksum,
            size: payload.size(),
            persisted: false,
            payload: Some(payload),
        };
        self.checkpoints.insert(id, checkpoint);

        if clean {
            self.last_known_good = Some(id);
        }
        tracing::debug!(checkpoint = ?id, ?revision, clean, "checkpoint created");

        Ok(CreatedCheckpoint {
            id,
            created: true,
            clean,
        })
    }

    pub fn get(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.get(&id)
    }

    pub fn contains(&self, id: CheckpointId) -> bool {
        self.checkpoints.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CheckpointId> + '_ {
        self.checkpoints.keys().copied()
    }

    /// Decrypt a checkpoint. The checksum is always verified; `validate`
    /// additionally runs the corruption detector.
    pub fn open(
        &self,
        id: CheckpointId,
        adapter: &dyn EncryptionAdapter,
        validate: bool,
    ) -> ResilienceResult<AccountState> {
        let checkpoint = self
            .checkpoints
            .get(&id)
            .ok_or(ResilienceError::CheckpointNotFound(id))?;
        let payload = checkpoint
            .payload
            .as_ref()
            .ok_or_else(|| ResilienceError::StorageFailure(format!("checkpoint {} evicted", id)))?;

        if payload.checksum() != checkpoint.checksum {
            return Err(ResilienceError::ChecksumMismatch);
        }
        let state: AccountState = payload.open(adapter)?;

        if validate {
            let findings = self.detector.findings(&state);
            if !findings.is_empty() {
                return Err(ResilienceError::CorruptionDetected(
                    findings.into_iter().map(|f| f.field).collect(),
                ));
            }
        }
        Ok(state)
    }

    pub fn mark_persisted(&mut self, id: CheckpointId) {
        if let Some(c) = self.checkpoints.get_mut(&id) {
            c.persisted = true;
        }
    }

    pub fn mark_last_known_good(&mut self, id: CheckpointId) -> bool {
        if self.checkpoints.contains_key(&id) {
            self.last_known_good = Some(id);
            true
        } else {
            false
        }
    }

    pub fn last_known_good(&self) -> Option<CheckpointId> {
        self.last_known_good
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    /// Highest revision any checkpoint captured
    pub fn latest_revision(&self) -> Option<Revision> {
        self.checkpoints.values().map(|c| c.metadata.revision).max()
    }

    /// Candidate ids newest first. With `prefer_crisis`, checkpoints holding
    /// an override come before the rest.
    pub fn candidates_newest_first(&self, prefer_crisis: bool) -> Vec<CheckpointId> {
        let newest_first = self.checkpoints.values().rev();
        if !prefer_crisis {
            return newest_first.map(|c| c.id).collect();
        }
        let (mut safe, rest): (Vec<_>, Vec<_>) =
            newest_first.partition(|c| c.retains_crisis_safety());
        safe.extend(rest);
        safe.into_iter().map(|c| c.id).collect()
    }

    /// Drop the in-memory payload of a persisted checkpoint. Returns the
    /// bytes freed.
    pub fn evict_payload(&mut self, id: CheckpointId) -> Option<usize> {
        let checkpoint = self.checkpoints.get_mut(&id)?;
        if !checkpoint.persisted {
            return None;
        }
        checkpoint.payload.take().map(|p| p.size())
    }

    /// Re-attach a payload loaded from the store
    pub fn rehydrate(&mut self, id: CheckpointId, payload: SealedPayload) -> ResilienceResult<()> {
        let checkpoint = self
            .checkpoints
            .get_mut(&id)
            .ok_or(ResilienceError::CheckpointNotFound(id))?;
        if payload.checksum() != checkpoint.checksum {
            return Err(ResilienceError::ChecksumMismatch);
        }
        checkpoint.payload = Some(payload);
        Ok(())
    }

    pub fn remove(&mut self, id: CheckpointId) -> Option<Checkpoint> {
        if self.last_known_good == Some(id) {
            self.last_known_good = None;
        }
        self.checkpoints.remove(&id)
    }

    /// Keep the `retain` newest checkpoints plus the last-known-good one and
    /// every id in `protected`. Returns the removed ids.
    pub fn prune(&mut self, retain: usize, protected: &BTreeSet<CheckpointId>) -> Vec<CheckpointId> {
        let keep: BTreeSet<CheckpointId> = self
            .checkpoints
            .keys()
            .rev()
            .take(retain.max(1))
            .copied()
            .chain(self.last_known_good)
            .chain(protected.iter().copied())
            .collect();

        let doomed: Vec<CheckpointId> = self
            .checkpoints
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in &doomed {
            self.checkpoints.remove(id);
        }
        doomed
    }

    /// Checkpoints beyond the `retain` newest that are not protected
    pub fn eviction_candidates(
        &self,
        retain: usize,
        protected: &BTreeSet<CheckpointId>,
    ) -> Vec<CheckpointId> {
        self.checkpoints
            .keys()
            .rev()
            .skip(retain.max(1))
            .filter(|id| Some(**id) != self.last_known_good && !protected.contains(id))
            .copied()
            .collect()
    }

    /// Bytes held by resident payloads
    pub fn resident_bytes(&self) -> usize {
        self.checkpoints
            .values()
            .filter_map(|c| c.payload.as_ref())
            .map(SealedPayload::size)
            .sum()
    }

    /// Forget everything, keeping ids monotonic
    pub fn clear(&mut self) {
        self.checkpoints.clear();
        self.last_known_good = None;
    }

    /// Avoid handing out ids already present in the store
    pub fn observe_id(&mut self, id: CheckpointId) {
        self.ids.observe(id.value());
    }
}
