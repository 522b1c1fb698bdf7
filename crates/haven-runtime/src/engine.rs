//! Resilience engine
//!
//! One context object owns every component. Mutating operations serialize on
//! a single async mutex. Durable writes are best-effort: the in-memory effect
//! is authoritative as soon as it happens, writes are queued for a background
//! task, and a failed write only degrades the engine. No store call runs
//! while the mutex is held.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use haven_core::{
    AccountState, BackupId, CheckpointId, ConflictId, CrisisOverride, DeviceId, FieldValue,
    IdSequence, OverrideFlags, OverrideId, ReportId, ResilienceError, ResilienceResult, Revision,
    Tier, Timestamp, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE,
};
use haven_crypto::{ChaChaAdapter, EncryptionAdapter, SealedPayload};
use haven_state::{
    apply_updates, merge_resolution, optimize_memory, validate_updates, Backup, BackupManager,
    CheckpointContext, CheckpointManager, CompressionResult, Conflict, ConflictResolution,
    ConflictResolver, ContinuityReport, CorruptionDetector, CorruptionReport, CrisisPlane,
    DeviceObservation, FieldUpdate, IncrementalUpdate, Journal, MemoryOptimization,
    OperationType, RecoveryCoordinator, RecoveryInputs, RecoveryOperation, RecoveryStrategy,
    ResolutionStrategy, RestoreResult, SeverityLevel, UpdateType, WriteLedger,
};
use haven_store::{
    decode_blob, BackingStore, DeviceSync, MemoryDeviceSync, MemoryStore, RecordKind,
    StoreResult, TierUpdate, BACKUP_PREFIX, CHECKPOINT_PREFIX, OVERRIDE_PREFIX, UPDATE_PREFIX,
};
use haven_time::{Clock, LatencyBook, LatencyTimer, SystemClock};

use crate::diagnostics::summarize_latency;
use crate::writeback::{Durable, Outcome, WriteBack};
use crate::{
    HealthCounters, PendingConflict, ResilienceConfig, ResilienceDiagnostics, ScheduledTask,
    ValidationConfig,
};

/// External capabilities the engine runs against
#[derive(Clone)]
pub struct EngineParts {
    pub store: Arc<dyn BackingStore>,
    pub crypto: Arc<dyn EncryptionAdapter>,
    pub clock: Arc<dyn Clock>,
    pub devices: Arc<dyn DeviceSync>,
}

impl EngineParts {
    /// Memory store, fresh random key, wall clock, memory device sync
    pub fn in_memory() -> Self {
        EngineParts {
            store: Arc::new(MemoryStore::new()),
            crypto: Arc::new(ChaChaAdapter::generate()),
            clock: Arc::new(SystemClock::new()),
            devices: Arc::new(MemoryDeviceSync::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn EncryptionAdapter>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceSync>) -> Self {
        self.devices = devices;
        self
    }
}

/// Request to enter crisis mode
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub reason: String,
    pub duration: Duration,
    pub flags: OverrideFlags,
}

impl OverrideRequest {
    /// Full-access override
    pub fn new(reason: impl Into<String>, duration: Duration) -> Self {
        OverrideRequest {
            reason: reason.into(),
            duration,
            flags: OverrideFlags::FULL,
        }
    }

    pub fn with_flags(mut self, flags: OverrideFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Per-device outcome of a tier push
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSyncReport {
    pub devices_updated: Vec<DeviceId>,
    pub errors: Vec<(DeviceId, String)>,
}

/// What a cleanup pass removed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub checkpoints_removed: Vec<CheckpointId>,
    pub journal_entries_removed: usize,
    pub backups_removed: Vec<BackupId>,
    pub overrides_expired: Vec<OverrideId>,
}

/// Everything behind the engine mutex
struct EngineState {
    account: AccountState,
    revision: Revision,
    detector: CorruptionDetector,
    checkpoints: CheckpointManager,
    journal: Journal,
    ledger: WriteLedger,
    backups: BackupManager,
    crisis: CrisisPlane,
    conflicts: ConflictResolver,
    recovery: RecoveryCoordinator,
    reports: IdSequence,
    last_report: Option<CorruptionReport>,
    recoveries: VecDeque<RecoveryOperation>,
    latency: LatencyBook,
    health: HealthCounters,
}

impl EngineState {
    fn new(config: &ResilienceConfig, initial: AccountState) -> Self {
        let mut ledger = WriteLedger::new();
        ledger.record_diff(Revision::ZERO, &AccountState::new(), &initial);
        EngineState {
            account: initial,
            revision: Revision::ZERO,
            detector: CorruptionDetector::new(),
            checkpoints: CheckpointManager::new(),
            journal: Journal::new(),
            ledger,
            backups: BackupManager::new(config.max_backups),
            crisis: CrisisPlane::new(),
            conflicts: ConflictResolver::new(),
            recovery: RecoveryCoordinator::new(),
            reports: IdSequence::new(),
            last_report: None,
            recoveries: VecDeque::new(),
            latency: LatencyBook::new(),
            health: HealthCounters::default(),
        }
    }

    /// Replace the account state under a new revision
    fn commit(&mut self, next: AccountState) -> Revision {
        let revision = self.revision.next();
        self.ledger.record_diff(revision, &self.account, &next);
        self.revision = revision;
        self.account = next;
        revision
    }

    /// Re-apply the plane to the current state, committing only on change
    fn remirror(&mut self, now: Timestamp) -> bool {
        let mut next = self.account.clone();
        self.crisis.mirror_into(&mut next, now);
        if next == self.account {
            return false;
        }
        self.commit(next);
        true
    }

    /// Point an override at its checkpoint and keep the state's copy equal
    /// to the plane's
    fn link_override(&mut self, id: OverrideId, checkpoint: CheckpointId, now: Timestamp) {
        self.crisis.set_checkpoint_ref(id, checkpoint);
        self.remirror(now);
    }

    /// Fold completed store calls into health, persisted marks and the
    /// journal failure counter
    fn absorb(&mut self, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Wrote(durable) => {
                    self.health.storage_ok();
                    match durable {
                        Durable::Checkpoint(id) => self.checkpoints.mark_persisted(id),
                        Durable::Update(id) if self.journal.get(id).is_some() => {
                            self.journal.mark_persisted(id)
                        }
                        _ => {}
                    }
                }
                Outcome::WriteFailed(durable) => {
                    self.health.storage_failed();
                    if matches!(durable, Durable::Update(_)) {
                        self.journal.record_write_failure();
                    }
                }
                Outcome::Failed => self.health.storage_failed(),
            }
        }
    }

    fn file_report(&mut self, mut report: CorruptionReport) -> CorruptionReport {
        report.id = ReportId::new(self.reports.take());
        report.last_valid_checkpoint = self.checkpoints.last_known_good();
        self.health.corruption_reports += 1;
        tracing::warn!(
            report = ?report.id,
            severity = %report.severity,
            fields = ?report.affected_fields,
            crisis_impact = report.crisis_impact,
            "state corruption detected"
        );
        self.last_report = Some(report.clone());
        report
    }

    fn record_latency(&mut self, timer: LatencyTimer) {
        let sample = timer.finish();
        if sample.exceeded {
            tracing::warn!(
                operation = sample.operation,
                elapsed_ms = sample.elapsed.as_millis() as u64,
                target_ms = sample.target.as_millis() as u64,
                "latency target exceeded"
            );
        }
        self.latency.record(sample);
    }
}

struct Shared {
    state: Mutex<EngineState>,
    writes: WriteBack,
    crypto: Arc<dyn EncryptionAdapter>,
    clock: Arc<dyn Clock>,
    devices: Arc<dyn DeviceSync>,
    config: ResilienceConfig,
    /// Crisis operations in flight; background ticks yield while non-zero
    crisis_in_flight: AtomicUsize,
    ticks_skipped: AtomicU64,
}

struct CrisisGuard<'a>(&'a AtomicUsize);

impl<'a> CrisisGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CrisisGuard(counter)
    }
}

impl Drop for CrisisGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to the background validation task
#[derive(Debug)]
pub struct ValidationHandle {
    task: ScheduledTask,
}

impl ValidationHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop validation. No tick runs after this returns.
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

/// Client-side resilience engine for one account
#[derive(Clone)]
pub struct ResilienceEngine {
    shared: Arc<Shared>,
}

impl ResilienceEngine {
    pub fn new(parts: EngineParts, config: ResilienceConfig, initial: AccountState) -> Self {
        let state = EngineState::new(&config, initial);
        ResilienceEngine {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                writes: WriteBack::new(parts.store, config.store_timeout()),
                crypto: parts.crypto,
                clock: parts.clock,
                devices: parts.devices,
                config,
                crisis_in_flight: AtomicUsize::new(0),
                ticks_skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Engine over in-memory capabilities with default configuration
    pub fn in_memory(initial: AccountState) -> Self {
        ResilienceEngine::new(EngineParts::in_memory(), ResilienceConfig::default(), initial)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> AccountState {
        self.lock().await.account.clone()
    }

    pub async fn revision(&self) -> Revision {
        self.lock().await.revision
    }

    /// Hand the engine a state produced elsewhere. Not validated; the
    /// detector and background validation catch what is wrong with it.
    pub async fn replace_state(&self, next: AccountState) -> Revision {
        let mut st = self.lock().await;
        let revision = st.commit(next);
        tracing::debug!(?revision, "state replaced by producer");
        revision
    }

    pub async fn is_degraded(&self) -> bool {
        self.lock().await.health.degraded
    }

    /// Wait until every durable write queued so far has been applied or
    /// has failed, and fold the outcomes into the health counters
    pub async fn flush_writes(&self) {
        self.shared.writes.flush().await;
        let _ = self.lock().await;
    }

    // ---- checkpoints ----

    /// Snapshot the current state. Retrying the same context on an
    /// unchanged state returns the same id.
    pub async fn create_state_checkpoint(
        &self,
        ctx: CheckpointContext,
    ) -> ResilienceResult<CheckpointId> {
        let timer = LatencyTimer::start("create_checkpoint", self.config().latency.checkpoint());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let id = self.checkpoint_locked(st, &ctx)?;
        st.record_latency(timer);
        Ok(id)
    }

    /// Restore a checkpoint. Unknown, unreadable, tampered or (with
    /// `validate`) corrupt checkpoints return false and change nothing.
    pub async fn rollback_to_checkpoint(&self, id: CheckpointId, validate: bool) -> bool {
        let fetched = self.fetch_evicted(Some(id)).await;
        let mut guard = self.lock().await;
        let st = &mut *guard;
        self.rehydrate(st, fetched);
        if !st.checkpoints.get(id).map_or(false, |c| c.is_resident()) {
            return false;
        }

        match st.checkpoints.open(id, self.crypto(), validate) {
            Ok(mut restored) => {
                let now = self.now();
                st.crisis.mirror_into(&mut restored, now);
                let revision = st.commit(restored);
                tracing::info!(checkpoint = ?id, ?revision, "rolled back to checkpoint");
                true
            }
            Err(e) => {
                tracing::warn!(checkpoint = ?id, error = %e, "rollback refused");
                false
            }
        }
    }

    // ---- corruption and recovery ----

    pub async fn detect_state_corruption(&self) -> Option<CorruptionReport> {
        let timer = LatencyTimer::start("detect_corruption", self.config().latency.detection());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let found = st.detector.detect(&st.account, self.now());
        let filed = found.map(|report| st.file_report(report));
        st.record_latency(timer);
        filed
    }

    pub async fn perform_state_recovery(
        &self,
        report: &CorruptionReport,
        strategy: RecoveryStrategy,
    ) -> RecoveryOperation {
        let _guard = report
            .crisis_impact
            .then(|| CrisisGuard::enter(&self.shared.crisis_in_flight));
        let timer = LatencyTimer::start("perform_recovery", self.config().latency.recovery());
        let fetched = if strategy == RecoveryStrategy::Manual {
            Vec::new()
        } else {
            self.fetch_evicted(None).await
        };
        let mut guard = self.lock().await;
        let st = &mut *guard;
        self.rehydrate(st, fetched);

        let now = self.now();
        let outcome = st.recovery.recover(
            strategy,
            RecoveryInputs {
                report,
                current: &st.account,
                checkpoints: &st.checkpoints,
                journal: &st.journal,
                ledger: &st.ledger,
                plane: &mut st.crisis,
                adapter: self.shared.crypto.as_ref(),
                now,
                emergency_duration: self.config().emergency_duration(),
            },
        );
        let operation = outcome.operation;

        if let Some(restored) = outcome.restored {
            st.commit(restored);

            let ctx = CheckpointContext::new(
                OperationType::Recovery,
                format!("recovery-{}", operation.report_id),
            )
            .in_crisis(st.crisis.is_crisis_mode());
            match self.checkpoint_locked(st, &ctx) {
                Ok(checkpoint) if operation.emergency_fallback => {
                    if let Some(id) = st.crisis.newest_active(now).map(|o| o.id) {
                        st.link_override(id, checkpoint, now);
                        self.persist_override(st, id);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "post-recovery checkpoint failed"),
            }
        }

        st.health.recoveries += 1;
        st.recoveries.push_back(operation.clone());
        while st.recoveries.len() > self.config().recovery_history {
            st.recoveries.pop_front();
        }
        st.record_latency(timer);

        tracing::info!(
            report = ?operation.report_id,
            ?strategy,
            status = ?operation.status,
            data_loss = operation.data_loss,
            emergency_fallback = operation.emergency_fallback,
            "recovery finished"
        );
        operation
    }

    // ---- conflicts ----

    /// Record device observations and report divergent field families.
    /// Only the newest observation per device, by `sync_counter`, takes part;
    /// a report with a lower counter than one already held is ignored.
    pub async fn detect_state_conflicts(
        &self,
        observations: Vec<DeviceObservation>,
    ) -> Vec<Conflict> {
        let timer = LatencyTimer::start("detect_conflicts", self.config().latency.conflict());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        st.conflicts.observe(observations);
        let found = st.conflicts.detect(self.now());
        if !found.is_empty() {
            tracing::info!(conflicts = found.len(), "device conflicts detected");
        }
        st.record_latency(timer);
        found
    }

    /// Re-run detection over the observations already recorded
    pub async fn scan_for_conflicts(&self) -> Vec<Conflict> {
        let mut st = self.lock().await;
        let now = self.now();
        st.conflicts.detect(now)
    }

    /// Resolve a pending conflict and merge the winner into the state. A
    /// winner that would revoke an active override is refused with
    /// `ConflictUnresolved` and the conflict stays pending as manual.
    pub async fn resolve_state_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> ResilienceResult<ConflictResolution> {
        let timer = LatencyTimer::start("resolve_conflict", self.config().latency.conflict());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let result = st.conflicts.resolve(id, strategy, &st.crisis, now);
        if let Ok(resolution) = &result {
            let mut next = st.account.clone();
            merge_resolution(&mut next, resolution, &st.crisis, now);
            st.commit(next);

            let ctx = CheckpointContext::new(
                OperationType::ConflictResolution,
                format!("conflict-{}", id),
            )
                .in_crisis(st.crisis.is_crisis_mode());
            if let Err(e) = self.checkpoint_locked(st, &ctx) {
                tracing::warn!(error = %e, "post-resolution checkpoint failed");
            }
        }
        st.record_latency(timer);
        result
    }

    /// Push `tier` to each device. Failures are collected per device.
    /// With `crisis_safe` the newest active override travels with the tier.
    pub async fn synchronize_subscription_tier(
        &self,
        tier: Tier,
        devices: &[DeviceId],
        crisis_safe: bool,
    ) -> TierSyncReport {
        let now = self.now();
        let crisis_override = if crisis_safe {
            self.lock().await.crisis.newest_active(now).cloned()
        } else {
            None
        };
        let update = TierUpdate {
            tier,
            crisis_override,
            issued_at: now,
        };

        let mut report = TierSyncReport::default();
        for device in devices {
            match self.shared.devices.push_tier(device, &update).await {
                Ok(()) => report.devices_updated.push(device.clone()),
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "tier push failed");
                    report.errors.push((device.clone(), e.to_string()));
                }
            }
        }
        tracing::info!(
            tier = tier.as_str(),
            updated = report.devices_updated.len(),
            failed = report.errors.len(),
            "tier synchronized"
        );
        report
    }

    // ---- journal ----

    /// Validate and apply a batch. Any invalid entry rejects the whole batch
    /// before anything changes. With `persist` the entry is journaled and
    /// written under `update_<id>`.
    pub async fn perform_incremental_update(
        &self,
        update_type: UpdateType,
        mut field_updates: Vec<FieldUpdate>,
        persist: bool,
    ) -> ResilienceResult<IncrementalUpdate> {
        let timer = LatencyTimer::start("incremental_update", self.config().latency.update());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        validate_updates(&field_updates, st.crisis.has_active(now))?;

        for update in &mut field_updates {
            if update.old_value.is_none() {
                update.old_value = st.account.get(&update.field).cloned();
            }
        }
        let mut next = st.account.clone();
        apply_updates(&mut next, &field_updates);
        let revision = st.commit(next);

        let id = st.journal.next_id();
        let update = IncrementalUpdate::new(id, update_type, field_updates, revision, now);

        if persist {
            st.journal.append(update.clone());
            match SealedPayload::seal(self.crypto(), &update) {
                Ok(sealed) => self.shared.writes.put(
                    RecordKind::Update.key(id),
                    sealed.blob(),
                    Durable::Update(id),
                ),
                Err(e) => {
                    tracing::warn!(update = ?id, error = %e, "journal entry could not be sealed");
                    st.journal.record_write_failure();
                }
            }
        }

        tracing::debug!(
            update = ?id,
            ?update_type,
            ?revision,
            persist,
            "incremental update applied"
        );
        st.record_latency(timer);
        Ok(update)
    }

    // ---- backups ----

    pub async fn create_state_backup(&self, encrypt: bool) -> ResilienceResult<Backup> {
        let timer = LatencyTimer::start("create_backup", self.config().latency.backup());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let backup = st
            .backups
            .create(self.crypto(), &st.account, encrypt, now, st.revision)?;
        if let Some(blob) = st.backups.sealed_blob(backup.id) {
            self.shared
                .writes
                .put(RecordKind::Backup.key(backup.id), blob, Durable::Other);
        }
        for doomed in st.backups.enforce_retention() {
            self.shared.writes.remove(RecordKind::Backup.key(doomed));
        }

        st.record_latency(timer);
        Ok(backup)
    }

    /// Restore a backup, importing it from the store when it is no longer
    /// in memory. A failed restore leaves the state untouched.
    pub async fn restore_from_backup(
        &self,
        id: BackupId,
        validate: bool,
    ) -> ResilienceResult<RestoreResult> {
        let timer = LatencyTimer::start("restore_backup", self.config().latency.backup());
        let resident = self.lock().await.backups.contains(id);
        let stored = if resident {
            None
        } else {
            Some(self.shared.writes.read(&RecordKind::Backup.key(id)).await)
        };
        let mut guard = self.lock().await;
        let st = &mut *guard;

        if !st.backups.contains(id) {
            if let Err(reason) = self.import_backup(st, id, stored)? {
                return Ok(RestoreResult {
                    success: false,
                    restored_state: None,
                    validation_errors: vec![reason],
                    data_loss: false,
                });
            }
        }

        let latest = st.checkpoints.latest_revision();
        let mut result = st.backups.restore(id, self.crypto(), validate, latest)?;
        if result.success {
            if let Some(mut restored) = result.restored_state.take() {
                let now = self.now();
                st.crisis.mirror_into(&mut restored, now);
                let revision = st.commit(restored.clone());
                result.restored_state = Some(restored);
                tracing::info!(
                    backup = ?id,
                    ?revision,
                    data_loss = result.data_loss,
                    "backup restored"
                );

                let ctx = CheckpointContext::new(OperationType::Restore, format!("backup-{}", id))
                    .in_crisis(st.crisis.is_crisis_mode());
                if let Err(e) = self.checkpoint_locked(st, &ctx) {
                    tracing::warn!(error = %e, "post-restore checkpoint failed");
                }
            }
        } else {
            tracing::warn!(
                backup = ?id,
                errors = ?result.validation_errors,
                "backup restore refused"
            );
        }

        st.record_latency(timer);
        Ok(result)
    }

    // ---- crisis plane ----

    /// Install an override and enter crisis mode. The override references a
    /// crisis checkpoint taken right after it is mirrored into the state.
    pub async fn enable_crisis_mode(
        &self,
        request: OverrideRequest,
        persist: bool,
    ) -> ResilienceResult<CrisisOverride> {
        if request.duration.is_zero() {
            return Err(ResilienceError::validation(
                FIELD_CRISIS_OVERRIDE,
                "override duration must be positive",
            ));
        }
        let _crisis = CrisisGuard::enter(&self.shared.crisis_in_flight);
        let timer = LatencyTimer::start("enable_crisis_mode", self.config().latency.crisis());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let id = st.crisis.next_override_id();
        let installed = CrisisOverride::new(
            id,
            request.reason,
            now,
            now.saturating_add(request.duration),
            request.flags,
        );
        st.crisis.install(installed.clone());
        st.crisis.enable();
        st.remirror(now);

        let ctx =
            CheckpointContext::new(OperationType::CrisisActivation, format!("override-{}", id))
            .in_crisis(true);
        // Activation never fails on checkpointing
        match self.checkpoint_locked(st, &ctx) {
            Ok(checkpoint) => st.link_override(id, checkpoint, now),
            Err(e) => tracing::warn!(error = %e, "crisis checkpoint failed"),
        }
        if persist {
            self.persist_override(st, id);
        }

        st.record_latency(timer);
        tracing::info!(id = ?id, expires_at = ?installed.expires_at, "crisis mode enabled");
        Ok(st.crisis.get(id).cloned().unwrap_or(installed))
    }

    /// Clear the crisis flag. Overrides stay in place.
    pub async fn disable_crisis_mode(&self, validate: bool) -> ResilienceResult<()> {
        let _crisis = CrisisGuard::enter(&self.shared.crisis_in_flight);
        let timer = LatencyTimer::start("disable_crisis_mode", self.config().latency.crisis());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let mut next = st.account.clone();
        next.set(FIELD_CRISIS_MODE, FieldValue::Bool(false));

        if validate {
            if !st.crisis.is_preserved_in(&next, now) {
                return Err(ResilienceError::CrisisSafetyViolation(
                    "active override is missing from the state".to_string(),
                ));
            }
            if let Some(report) = st.detector.detect(&next, now).filter(|r| r.crisis_impact) {
                return Err(ResilienceError::CrisisSafetyViolation(format!(
                    "crisis-impacting findings in {:?}",
                    report.affected_fields
                )));
            }
        }

        st.crisis.disable();
        st.commit(next);
        st.record_latency(timer);
        tracing::info!(overrides = st.crisis.active(now).len(), "crisis mode disabled");
        Ok(())
    }

    /// Remove an override before it expires
    pub async fn retire_override(&self, id: OverrideId) -> ResilienceResult<CrisisOverride> {
        let _crisis = CrisisGuard::enter(&self.shared.crisis_in_flight);
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let removed = st.crisis.retire(id, now)?;

        // Access grants stay; the subscription producer owns them
        let mut next = st.account.clone();
        if next.crisis_override().map_or(false, |held| held.id == id) {
            match st.crisis.newest_active(now) {
                Some(o) => next.apply_override(o),
                None => {
                    next.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
                }
            }
        }
        st.commit(next);
        self.shared.writes.remove(RecordKind::Override.key(id));
        Ok(removed)
    }

    /// Map a severity to available features. Critical severity with no
    /// active override installs an emergency override and enters crisis
    /// mode.
    pub async fn ensure_therapeutic_continuity(&self, level: SeverityLevel) -> ContinuityReport {
        let _crisis = CrisisGuard::enter(&self.shared.crisis_in_flight);
        let timer = LatencyTimer::start("ensure_continuity", self.config().latency.crisis());
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let before: BTreeSet<OverrideId> = st.crisis.active(now).iter().map(|o| o.id).collect();
        let report = st
            .crisis
            .ensure_continuity(level, now, self.config().emergency_duration());
        let installed: Vec<OverrideId> = report
            .overrides_applied
            .iter()
            .filter(|id| !before.contains(id))
            .copied()
            .collect();

        if !installed.is_empty() {
            st.crisis.enable();
            st.remirror(now);
            let ctx = CheckpointContext::new(
                OperationType::CrisisActivation,
                format!("continuity-{:?}", level),
            )
                .in_crisis(true);
            match self.checkpoint_locked(st, &ctx) {
                Ok(checkpoint) => {
                    for id in &installed {
                        st.link_override(*id, checkpoint, now);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "crisis checkpoint failed"),
            }
            for id in installed {
                self.persist_override(st, id);
            }
        }

        st.record_latency(timer);
        tracing::debug!(
            ?level,
            maintained = report.continuity_maintained,
            restricted = report.restricted_features.len(),
            "therapeutic continuity evaluated"
        );
        report
    }

    // ---- performance ----

    /// Archive payment records older than the newest `retain_recent`
    /// (configured default when `None`)
    pub async fn compress_payment_history(
        &self,
        retain_recent: Option<usize>,
    ) -> ResilienceResult<CompressionResult> {
        let performance = &self.config().performance;
        let mut st = self.lock().await;

        let mut next = st.account.clone();
        let result = haven_state::compress_payment_history(
            &mut next,
            retain_recent.unwrap_or(performance.history_retain_recent),
            performance.compression_threshold_bytes,
        )?;
        if result.items_compressed > 0 {
            st.commit(next);
            tracing::info!(
                items = result.items_compressed,
                ratio = result.ratio,
                "payment history compressed"
            );
        }
        Ok(result)
    }

    /// Release checkpoint memory beyond the retention window
    pub async fn optimize_memory_usage(&self) -> MemoryOptimization {
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let protected = st.crisis.protected_checkpoints(self.now());

        let result = optimize_memory(
            &mut st.checkpoints,
            self.config().checkpoint_retention,
            &protected,
            self.config().performance.lazy_loading,
        );
        for id in &result.removed {
            self.shared.writes.remove(RecordKind::Checkpoint.key(id));
        }

        tracing::info!(
            freed = result.memory_freed,
            evicted = result.evicted.len(),
            removed = result.removed.len(),
            "memory optimized"
        );
        result
    }

    // ---- background validation ----

    /// Spawn periodic validation on the current tokio runtime
    pub fn start_background_validation(&self, config: ValidationConfig) -> ValidationHandle {
        let engine = self.clone();
        let period = config.interval();
        let task = ScheduledTask::spawn("background-validation", period, move |tick| {
            let engine = engine.clone();
            let config = config.clone();
            async move { engine.validation_tick(tick, &config).await }
        });
        ValidationHandle { task }
    }

    async fn validation_tick(&self, tick: u64, config: &ValidationConfig) {
        if self.shared.crisis_in_flight.load(Ordering::SeqCst) > 0 {
            self.shared.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(tick, "validation tick yielded to crisis operation");
            return;
        }

        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();
        st.health.validation_ticks += 1;
        st.health.last_validation_at = Some(now);

        // Stage 1: crisis fields, every tick while an override is active
        if config.crisis_validation_priority && st.crisis.has_active(now) {
            st.health.crisis_checks += 1;
            if st.remirror(now) {
                tracing::warn!(tick, "active override re-applied by background validation");
            }
        }

        if tick % config.full_validation_every.max(1) != 0 {
            return;
        }

        // Stage 2: full corruption scan
        let found = st.detector.detect(&st.account, now);
        if let Some(report) = found {
            st.file_report(report);
        }

        // Stage 3: device conflicts
        if config.conflict_scan {
            let conflicts = st.conflicts.detect(now);
            if config.auto_resolve_conflicts {
                for id in st.conflicts.auto_resolvable() {
                    let resolved =
                        st.conflicts
                            .resolve(id, ResolutionStrategy::LastWriterWins, &st.crisis, now);
                    match resolved {
                        Ok(resolution) => {
                            let mut next = st.account.clone();
                            merge_resolution(&mut next, &resolution, &st.crisis, now);
                            st.commit(next);
                            st.health.conflicts_auto_resolved += 1;
                        }
                        Err(e) => {
                            tracing::debug!(conflict = ?id, error = %e, "left for manual resolution")
                        }
                    }
                }
            }
            tracing::debug!(tick, conflicts = conflicts.len(), "full validation pass");
        }
    }

    // ---- diagnostics and maintenance ----

    pub async fn generate_resilience_diagnostics(&self) -> ResilienceDiagnostics {
        let st = self.lock().await;
        let now = self.now();

        let mut health = st.health.clone();
        health.ticks_skipped = self.shared.ticks_skipped.load(Ordering::Relaxed);

        ResilienceDiagnostics {
            generated_at: now,
            revision: st.revision,
            state_valid: st.detector.is_clean(&st.account),
            crisis_mode: st.crisis.is_crisis_mode(),
            active_overrides: st.crisis.active(now).iter().map(|o| o.id).collect(),
            checkpoints: st.checkpoints.len(),
            resident_checkpoint_bytes: st.checkpoints.resident_bytes(),
            last_known_good: st.checkpoints.last_known_good(),
            journal_entries: st.journal.len(),
            journal_write_failures: st.journal.consecutive_failures(),
            pending_writes: self.shared.writes.pending(),
            backups: st.backups.list().map(|b| b.id).collect(),
            pending_conflicts: st
                .conflicts
                .pending()
                .map(|c| PendingConflict {
                    id: c.id,
                    fields: c.fields.clone(),
                    crisis_impact: c.crisis_impact,
                    auto_resolvable: c.auto_resolvable,
                })
                .collect(),
            conflicts_resolved: st.conflicts.resolved_count(),
            conflicts_escalated: st.conflicts.escalated_count(),
            last_report: st.last_report.clone(),
            recent_recoveries: st.recoveries.iter().cloned().collect(),
            latency: summarize_latency(&st.latency),
            health,
        }
    }

    /// Prune checkpoints, unreplayable journal entries, expired overrides
    /// and surplus backups, in memory and in the store
    pub async fn cleanup_resilience_data(&self) -> CleanupReport {
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();
        let mut report = CleanupReport::default();

        report.overrides_expired = st.crisis.purge_expired(now);
        for id in &report.overrides_expired {
            self.shared.writes.remove(RecordKind::Override.key(id));
        }

        let protected = st.crisis.protected_checkpoints(now);
        report.checkpoints_removed = st
            .checkpoints
            .prune(self.config().checkpoint_retention, &protected);
        for id in &report.checkpoints_removed {
            self.shared.writes.remove(RecordKind::Checkpoint.key(id));
        }

        // Entries covered by every remaining checkpoint are never replayed
        let oldest = st
            .checkpoints
            .ids()
            .filter_map(|id| st.checkpoints.get(id))
            .map(|c| c.metadata.revision)
            .min();
        if let Some(revision) = oldest {
            let pruned = st.journal.prune_through(revision);
            report.journal_entries_removed = pruned.len();
            for id in pruned {
                self.shared.writes.remove(RecordKind::Update.key(id));
            }
        }

        report.backups_removed = st.backups.enforce_retention();
        for id in &report.backups_removed {
            self.shared.writes.remove(RecordKind::Backup.key(id));
        }

        tracing::info!(
            checkpoints = report.checkpoints_removed.len(),
            journal = report.journal_entries_removed,
            backups = report.backups_removed.len(),
            overrides = report.overrides_expired.len(),
            "resilience data cleaned up"
        );
        report
    }

    /// Drop every checkpoint, journal entry, backup and conflict, in memory
    /// and every matching record in the store, including records left by an
    /// earlier session. With `preserve_crisis_overrides` unexpired overrides
    /// and crisis mode survive; otherwise every override is removed from the
    /// plane, the state and the store.
    pub async fn reset_resilience_store(&self, preserve_crisis_overrides: bool) {
        let mut guard = self.lock().await;
        let st = &mut *guard;
        let now = self.now();

        let mut prefixes = vec![CHECKPOINT_PREFIX, UPDATE_PREFIX, BACKUP_PREFIX];
        if preserve_crisis_overrides {
            let expired: Vec<OverrideId> = st
                .crisis
                .all()
                .filter(|o| !o.is_active(now))
                .map(|o| o.id)
                .collect();
            for id in expired {
                self.shared.writes.remove(RecordKind::Override.key(id));
            }
        } else {
            prefixes.push(OVERRIDE_PREFIX);
        }
        self.shared.writes.purge(prefixes);

        st.checkpoints.clear();
        st.journal.clear();
        st.ledger.clear();
        st.backups.clear();
        st.conflicts.clear();
        st.crisis.clear(preserve_crisis_overrides, now);
        st.last_report = None;
        st.recoveries.clear();
        st.latency.clear();
        st.health = HealthCounters::default();

        if !preserve_crisis_overrides {
            let mut next = st.account.clone();
            next.set(FIELD_CRISIS_MODE, FieldValue::Bool(false));
            next.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
            st.commit(next);
        }
        tracing::info!(preserve_crisis_overrides, "resilience store reset");
    }

    // ---- internals ----

    /// Take the state lock, folding in store outcomes completed since the
    /// last time
    async fn lock(&self) -> MutexGuard<'_, EngineState> {
        let mut st = self.shared.state.lock().await;
        let outcomes = self.shared.writes.take_outcomes();
        if !outcomes.is_empty() {
            st.absorb(outcomes);
        }
        st
    }

    fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    fn crypto(&self) -> &dyn EncryptionAdapter {
        self.shared.crypto.as_ref()
    }

    fn checkpoint_locked(
        &self,
        st: &mut EngineState,
        ctx: &CheckpointContext,
    ) -> ResilienceResult<CheckpointId> {
        let created = st
            .checkpoints
            .create(self.crypto(), &st.account, ctx, self.now(), st.revision)?;
        if created.created {
            tracing::info!(
                checkpoint = ?created.id,
                operation = ?ctx.operation_type,
                revision = ?st.revision,
                clean = created.clean,
                "checkpoint created"
            );
        }

        // A retry also retries a write that failed the first time
        let pending = st
            .checkpoints
            .get(created.id)
            .filter(|c| !c.persisted)
            .and_then(|c| c.payload());
        if let Some(payload) = pending {
            self.shared.writes.put(
                RecordKind::Checkpoint.key(created.id),
                payload.blob(),
                Durable::Checkpoint(created.id),
            );
        }
        Ok(created.id)
    }

    /// Read evicted checkpoint payloads back from the store without holding
    /// the state lock. `only` narrows the read to one checkpoint.
    async fn fetch_evicted(&self, only: Option<CheckpointId>) -> Vec<(CheckpointId, String)> {
        let evicted: Vec<CheckpointId> = {
            let st = self.lock().await;
            let ids = st
                .checkpoints
                .ids()
                .filter(|id| only.map_or(true, |wanted| wanted == *id))
                .filter(|id| st.checkpoints.get(*id).map_or(false, |c| !c.is_resident()))
                .collect();
            ids
        };

        let mut fetched = Vec::with_capacity(evicted.len());
        for id in evicted {
            match self.shared.writes.read(&RecordKind::Checkpoint.key(id)).await {
                Ok(Some(text)) => fetched.push((id, text)),
                Ok(None) => tracing::warn!(checkpoint = ?id, "evicted checkpoint missing from store"),
                Err(e) => tracing::warn!(checkpoint = ?id, error = %e, "checkpoint reload failed"),
            }
        }
        fetched
    }

    /// Put fetched payloads back into still-evicted checkpoints. A payload
    /// that fails to decrypt or to match its checksum is dropped.
    fn rehydrate(&self, st: &mut EngineState, fetched: Vec<(CheckpointId, String)>) {
        for (id, text) in fetched {
            if st.checkpoints.get(id).map_or(true, |c| c.is_resident()) {
                continue;
            }
            let key = RecordKind::Checkpoint.key(id);
            let loaded = decode_blob(&key, &text)
                .map_err(ResilienceError::from)
                .and_then(|blob| SealedPayload::from_blob(self.crypto(), blob))
                .and_then(|payload| st.checkpoints.rehydrate(id, payload));
            match loaded {
                Ok(()) => tracing::debug!(checkpoint = ?id, "checkpoint reloaded from store"),
                Err(e) => tracing::warn!(checkpoint = ?id, error = %e, "stored checkpoint rejected"),
            }
        }
    }

    /// Bring a backup back from what was read from the store. The inner
    /// error is a restore failure reason; only a missing backup is an error.
    fn import_backup(
        &self,
        st: &mut EngineState,
        id: BackupId,
        stored: Option<StoreResult<Option<String>>>,
    ) -> ResilienceResult<Result<(), String>> {
        let text = match stored {
            Some(Ok(Some(text))) => text,
            Some(Ok(None)) | None => return Err(ResilienceError::BackupNotFound(id)),
            Some(Err(e)) => {
                tracing::warn!(backup = ?id, error = %e, "backup read failed");
                return Err(ResilienceError::BackupNotFound(id));
            }
        };

        let key = RecordKind::Backup.key(id);
        let imported = decode_blob(&key, &text)
            .map_err(ResilienceError::from)
            .and_then(|blob| st.backups.import(self.crypto(), blob));
        match imported {
            Ok(backup) if backup.id == id => Ok(Ok(())),
            Ok(backup) => Ok(Err(format!("stored backup holds {:?}", backup.id))),
            Err(e) => Ok(Err(e.to_string())),
        }
    }

    fn persist_override(&self, st: &EngineState, id: OverrideId) {
        let Some(o) = st.crisis.get(id) else {
            return;
        };
        match SealedPayload::seal(self.crypto(), o) {
            Ok(sealed) => {
                self.shared
                    .writes
                    .put(RecordKind::Override.key(id), sealed.blob(), Durable::Other)
            }
            Err(e) => tracing::warn!(id = ?id, error = %e, "override could not be sealed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::{FIELD_EMERGENCY_ACCESS, FIELD_STATUS, FIELD_TIER};
    use haven_state::{Feature, RecoveryStatus};
    use haven_store::{encode_blob, BACKUP_PREFIX, CHECKPOINT_PREFIX, OVERRIDE_PREFIX, UPDATE_PREFIX};
    use haven_time::ManualClock;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Harness {
        engine: ResilienceEngine,
        store: MemoryStore,
        devices: MemoryDeviceSync,
        clock: ManualClock,
    }

    /// Store whose calls never complete
    struct HangingStore;

    #[async_trait::async_trait]
    impl BackingStore for HangingStore {
        async fn get_item(&self, _key: &str) -> StoreResult<Option<String>> {
            std::future::pending().await
        }

        async fn set_item(&self, _key: &str, _value: String) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn remove_item(&self, _key: &str) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn list_keys(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            std::future::pending().await
        }
    }

    fn harness_with(config: ResilienceConfig) -> Harness {
        harness_on(MemoryStore::new(), config)
    }

    fn harness_on(store: MemoryStore, config: ResilienceConfig) -> Harness {
        let devices = MemoryDeviceSync::new();
        let clock = ManualClock::default();
        let parts = EngineParts::in_memory()
            .with_store(Arc::new(store.clone()))
            .with_devices(Arc::new(devices.clone()))
            .with_clock(Arc::new(clock.clone()));
        Harness {
            engine: ResilienceEngine::new(parts, config, AccountState::for_user("u-1", "basic")),
            store,
            devices,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(ResilienceConfig::default())
    }

    fn manual(id: &str) -> CheckpointContext {
        CheckpointContext::new(OperationType::Manual, id)
    }

    fn tier(value: &str) -> Vec<FieldUpdate> {
        vec![FieldUpdate::new(FIELD_TIER, FieldValue::text(value))]
    }

    #[tokio::test]
    async fn test_checkpoint_is_persisted_and_idempotent() {
        let h = harness();
        let first = h.engine.create_state_checkpoint(manual("a")).await.unwrap();
        let again = h.engine.create_state_checkpoint(manual("a")).await.unwrap();
        assert_eq!(first, again);
        h.engine.flush_writes().await;
        assert_eq!(h.store.keys_with_prefix(CHECKPOINT_PREFIX).len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_and_unknown_is_false() {
        let h = harness();
        let id = h.engine.create_state_checkpoint(manual("a")).await.unwrap();
        h.engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), true)
            .await
            .unwrap();

        assert!(h.engine.rollback_to_checkpoint(id, true).await);
        assert_eq!(h.engine.state().await.tier(), Some("basic"));
        assert!(!h.engine.rollback_to_checkpoint(CheckpointId::new(99), true).await);
    }

    #[tokio::test]
    async fn test_rollback_reloads_evicted_checkpoint() {
        let h = harness_with(ResilienceConfig {
            checkpoint_retention: 1,
            ..Default::default()
        });
        let old = h.engine.create_state_checkpoint(manual("old")).await.unwrap();
        h.engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), false)
            .await
            .unwrap();
        h.engine.create_state_checkpoint(manual("new")).await.unwrap();
        h.engine.flush_writes().await;

        let optimized = h.engine.optimize_memory_usage().await;
        assert_eq!(optimized.evicted, vec![old]);

        assert!(h.engine.rollback_to_checkpoint(old, true).await);
        assert_eq!(h.engine.state().await.tier(), Some("basic"));
    }

    #[tokio::test]
    async fn test_tampered_store_copy_is_refused() {
        let h = harness_with(ResilienceConfig {
            checkpoint_retention: 1,
            ..Default::default()
        });
        let id = h.engine.create_state_checkpoint(manual("a")).await.unwrap();
        h.engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), false)
            .await
            .unwrap();
        h.engine.create_state_checkpoint(manual("b")).await.unwrap();
        h.engine.flush_writes().await;
        assert_eq!(h.engine.optimize_memory_usage().await.evicted, vec![id]);

        let key = RecordKind::Checkpoint.key(id);
        let mut blob = decode_blob(&key, &h.store.raw_get(&key).unwrap()).unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x55;
        h.store.raw_put(&key, encode_blob(&blob));

        assert!(!h.engine.rollback_to_checkpoint(id, false).await);
        assert_eq!(h.engine.state().await.tier(), Some("premium"));
    }

    #[tokio::test]
    async fn test_empty_field_rejected_without_writes() {
        let h = harness();
        let before = h.engine.state().await;
        let revision = h.engine.revision().await;

        let result = h
            .engine
            .perform_incremental_update(
                UpdateType::Profile,
                vec![FieldUpdate::new("", FieldValue::text("x"))],
                true,
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Validation { .. })));
        assert_eq!(h.engine.state().await, before);
        assert_eq!(h.engine.revision().await, revision);
        h.engine.flush_writes().await;
        assert!(h.store.keys_with_prefix(UPDATE_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_update_fills_old_values_and_journals() {
        let h = harness();
        let update = h
            .engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), true)
            .await
            .unwrap();
        assert_eq!(update.field_updates[0].old_value, Some(FieldValue::text("basic")));
        assert!(update.verify());
        h.engine.flush_writes().await;
        assert_eq!(h.store.keys_with_prefix(UPDATE_PREFIX).len(), 1);

        let unjournaled = h
            .engine
            .perform_incremental_update(UpdateType::Subscription, tier("family"), false)
            .await
            .unwrap();
        h.engine.flush_writes().await;
        assert_eq!(h.store.keys_with_prefix(UPDATE_PREFIX).len(), 1);
        assert!(unjournaled.revision > update.revision);
        assert_eq!(h.engine.generate_resilience_diagnostics().await.journal_entries, 1);
    }

    #[tokio::test]
    async fn test_crisis_mode_lifecycle() {
        let h = harness();
        let o = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic attack", DAY), true)
            .await
            .unwrap();
        assert!(o.checkpoint_ref.is_some());
        h.engine.flush_writes().await;
        assert_eq!(h.store.keys_with_prefix(OVERRIDE_PREFIX).len(), 1);

        let state = h.engine.state().await;
        assert!(state.crisis_mode());
        assert_eq!(state.crisis_override(), Some(&o));
        assert_eq!(state.get(FIELD_EMERGENCY_ACCESS), Some(&FieldValue::Bool(true)));

        // journal may not end crisis mode while the override is active
        let refused = h
            .engine
            .perform_incremental_update(
                UpdateType::Crisis,
                vec![FieldUpdate::new(FIELD_CRISIS_MODE, FieldValue::Bool(false))],
                true,
            )
            .await;
        assert!(matches!(refused, Err(ResilienceError::CrisisSafetyViolation(_))));

        h.engine.disable_crisis_mode(true).await.unwrap();
        let state = h.engine.state().await;
        assert!(!state.crisis_mode());
        assert_eq!(state.crisis_override().map(|held| held.id), Some(o.id));
    }

    #[tokio::test]
    async fn test_retire_refused_in_crisis_then_allowed() {
        let h = harness();
        let o = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
            .await
            .unwrap();

        assert!(matches!(
            h.engine.retire_override(o.id).await,
            Err(ResilienceError::CrisisSafetyViolation(_))
        ));

        h.engine.disable_crisis_mode(false).await.unwrap();
        h.engine.retire_override(o.id).await.unwrap();
        h.engine.flush_writes().await;
        assert!(h.engine.state().await.crisis_override().is_none());
        assert!(h.store.keys_with_prefix(OVERRIDE_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_zero_duration_override_rejected() {
        let h = harness();
        let result = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("x", Duration::ZERO), false)
            .await;
        assert!(matches!(result, Err(ResilienceError::Validation { .. })));
        assert!(!h.engine.state().await.crisis_mode());
    }

    #[tokio::test]
    async fn test_critical_continuity_installs_override() {
        let h = harness();
        let report = h
            .engine
            .ensure_therapeutic_continuity(SeverityLevel::Critical)
            .await;
        assert!(report.continuity_maintained);
        assert_eq!(report.overrides_applied.len(), 1);
        assert!(report.restricted_features.is_empty());

        let state = h.engine.state().await;
        assert!(state.crisis_mode());
        assert_eq!(state.crisis_override().map(|o| o.id), Some(report.overrides_applied[0]));

        let low = h.engine.ensure_therapeutic_continuity(SeverityLevel::Low).await;
        for feature in Feature::SAFETY {
            assert!(low.features_available.contains(&feature));
        }
    }

    #[tokio::test]
    async fn test_tier_sync_collects_device_errors() {
        let h = harness();
        h.engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), false)
            .await
            .unwrap();
        let phone = DeviceId::new("phone");
        let tablet = DeviceId::new("tablet");
        h.devices.set_unreachable(&tablet, true);

        let report = h
            .engine
            .synchronize_subscription_tier(Tier::Premium, &[phone.clone(), tablet.clone()], true)
            .await;
        assert_eq!(report.devices_updated, vec![phone.clone()]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, tablet);

        let delivered = h.devices.last_update(&phone).unwrap();
        assert_eq!(delivered.tier, Tier::Premium);
        assert!(delivered.crisis_override.is_some());
    }

    #[tokio::test]
    async fn test_backup_restore_from_store_after_reset() {
        let h = harness();
        h.engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), true)
            .await
            .unwrap();
        let backup = h.engine.create_state_backup(true).await.unwrap();
        h.engine.flush_writes().await;
        let blob_key = RecordKind::Backup.key(backup.id);
        let blob = h.store.raw_get(&blob_key).unwrap();

        h.engine.reset_resilience_store(false).await;
        h.engine.flush_writes().await;
        assert!(h.store.keys_with_prefix(BACKUP_PREFIX).is_empty());
        h.store.raw_put(&blob_key, blob);
        h.engine
            .perform_incremental_update(UpdateType::Subscription, tier("free"), false)
            .await
            .unwrap();

        let result = h.engine.restore_from_backup(backup.id, true).await.unwrap();
        assert!(result.success);
        assert_eq!(h.engine.state().await.tier(), Some("premium"));
    }

    #[tokio::test]
    async fn test_unknown_backup_is_error() {
        let h = harness();
        assert!(matches!(
            h.engine.restore_from_backup(BackupId::new(42), true).await,
            Err(ResilienceError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_backup_stays_in_memory() {
        let h = harness();
        let backup = h.engine.create_state_backup(false).await.unwrap();
        h.engine.flush_writes().await;
        assert!(h.store.keys_with_prefix(BACKUP_PREFIX).is_empty());
        assert!(h.engine.restore_from_backup(backup.id, true).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_detect_assigns_report_ids() {
        let h = harness();
        assert!(h.engine.detect_state_corruption().await.is_none());

        let mut broken = h.engine.state().await;
        broken.remove(FIELD_STATUS);
        h.engine.replace_state(broken).await;

        let first = h.engine.detect_state_corruption().await.unwrap();
        let second = h.engine.detect_state_corruption().await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.affects(FIELD_STATUS));

        let diagnostics = h.engine.generate_resilience_diagnostics().await;
        assert!(!diagnostics.state_valid);
        assert_eq!(diagnostics.last_report.map(|r| r.id), Some(second.id));
    }

    #[tokio::test]
    async fn test_recovery_recorded_in_diagnostics() {
        let h = harness();
        h.engine.create_state_checkpoint(manual("base")).await.unwrap();
        let mut broken = h.engine.state().await;
        broken.set(FIELD_TIER, FieldValue::Int(3));
        h.engine.replace_state(broken).await;

        let report = h.engine.detect_state_corruption().await.unwrap();
        let op = h
            .engine
            .perform_state_recovery(&report, RecoveryStrategy::CheckpointRollback)
            .await;
        assert_eq!(op.status, RecoveryStatus::Completed);
        assert!(h.engine.detect_state_corruption().await.is_none());

        let diagnostics = h.engine.generate_resilience_diagnostics().await;
        assert_eq!(diagnostics.recent_recoveries.len(), 1);
        assert_eq!(diagnostics.health.recoveries, 1);
        assert!(diagnostics.latency.contains_key("perform_recovery"));
    }

    #[tokio::test]
    async fn test_cleanup_prunes_and_spares_crisis_checkpoint() {
        let h = harness_with(ResilienceConfig {
            checkpoint_retention: 1,
            ..Default::default()
        });
        let nickname = |n: &str| vec![FieldUpdate::new("nickname", FieldValue::text(n))];

        for i in 0..2 {
            h.engine
                .perform_incremental_update(UpdateType::Profile, nickname(&format!("n{}", i)), true)
                .await
                .unwrap();
            h.engine.create_state_checkpoint(manual(&format!("c{}", i))).await.unwrap();
        }
        let o = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), false)
            .await
            .unwrap();
        h.engine
            .perform_incremental_update(UpdateType::Profile, nickname("n2"), true)
            .await
            .unwrap();
        h.engine.create_state_checkpoint(manual("c2")).await.unwrap();

        let report = h.engine.cleanup_resilience_data().await;
        h.engine.flush_writes().await;
        assert_eq!(report.checkpoints_removed.len(), 2);
        assert!(!report.checkpoints_removed.contains(&o.checkpoint_ref.unwrap()));
        // only entries older than the crisis checkpoint go
        assert_eq!(report.journal_entries_removed, 2);
        assert_eq!(h.store.keys_with_prefix(UPDATE_PREFIX).len(), 1);
        assert_eq!(
            h.store.keys_with_prefix(CHECKPOINT_PREFIX).len(),
            h.engine.generate_resilience_diagnostics().await.checkpoints
        );
    }

    #[tokio::test]
    async fn test_expired_overrides_cleaned_up() {
        let h = harness();
        let o = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", Duration::from_secs(60)), true)
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(120));

        let report = h.engine.cleanup_resilience_data().await;
        h.engine.flush_writes().await;
        assert_eq!(report.overrides_expired, vec![o.id]);
        assert!(h.store.keys_with_prefix(OVERRIDE_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_compress_payment_history() {
        let h = harness();
        let mut state = h.engine.state().await;
        for i in 0..100 {
            state.payment_history.push(haven_core::PaymentRecord {
                id: format!("pay-{}", i),
                amount_cents: 1_299,
                currency: "USD".into(),
                paid_at: Timestamp::from_secs(i * 86_400),
                description: "monthly subscription renewal".into(),
            });
        }
        h.engine.replace_state(state).await;

        let result = h.engine.compress_payment_history(Some(10)).await.unwrap();
        assert_eq!(result.items_compressed, 90);
        let state = h.engine.state().await;
        assert_eq!(state.payment_history.len(), 10);
        assert_eq!(state.tier(), Some("basic"));
    }

    #[tokio::test]
    async fn test_background_validation_reapplies_override() {
        let h = harness();
        let o = h
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), false)
            .await
            .unwrap();

        let mut broken = h.engine.state().await;
        broken.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
        h.engine.replace_state(broken).await;

        let handle = h.engine.start_background_validation(ValidationConfig {
            interval_ms: 5,
            full_validation_every: 1,
            ..Default::default()
        });
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        let state = h.engine.state().await;
        assert_eq!(state.crisis_override().map(|held| held.id), Some(o.id));
        let diagnostics = h.engine.generate_resilience_diagnostics().await;
        assert!(diagnostics.health.crisis_checks >= 1);

        // no tick after stop
        let ticks = diagnostics.health.validation_ticks;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            h.engine.generate_resilience_diagnostics().await.health.validation_ticks,
            ticks
        );
    }

    #[tokio::test]
    async fn test_reset_keeps_or_drops_overrides() {
        let kept = harness();
        let o = kept
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
            .await
            .unwrap();
        kept.engine.reset_resilience_store(true).await;
        kept.engine.flush_writes().await;
        let diagnostics = kept.engine.generate_resilience_diagnostics().await;
        assert_eq!(diagnostics.active_overrides, vec![o.id]);
        assert_eq!(diagnostics.checkpoints, 0);
        assert_eq!(kept.store.keys_with_prefix(OVERRIDE_PREFIX).len(), 1);
        assert!(kept.engine.state().await.crisis_mode());

        let dropped = harness();
        dropped
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
            .await
            .unwrap();
        dropped.engine.reset_resilience_store(false).await;
        dropped.engine.flush_writes().await;
        let diagnostics = dropped.engine.generate_resilience_diagnostics().await;
        assert!(diagnostics.active_overrides.is_empty());
        assert!(dropped.store.is_empty());
        let state = dropped.engine.state().await;
        assert!(!state.crisis_mode());
        assert!(state.crisis_override().is_none());
    }

    #[tokio::test]
    async fn test_reset_purges_records_from_earlier_sessions() {
        let store = MemoryStore::new();
        let earlier = harness_on(store.clone(), ResilienceConfig::default());
        earlier
            .engine
            .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
            .await
            .unwrap();
        earlier
            .engine
            .perform_incremental_update(UpdateType::Subscription, tier("premium"), true)
            .await
            .unwrap();
        earlier.engine.create_state_backup(true).await.unwrap();
        earlier.engine.flush_writes().await;
        drop(earlier);
        assert_eq!(store.keys_with_prefix(OVERRIDE_PREFIX).len(), 1);
        assert!(store.len() > 1);

        // a fresh engine knows none of these records
        let kept = harness_on(store.clone(), ResilienceConfig::default());
        kept.engine.reset_resilience_store(true).await;
        kept.engine.flush_writes().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys_with_prefix(OVERRIDE_PREFIX).len(), 1);

        let dropped = harness_on(store.clone(), ResilienceConfig::default());
        dropped.engine.reset_resilience_store(false).await;
        dropped.engine.flush_writes().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hanging_store_never_delays_crisis_activation() {
        let parts = EngineParts::in_memory()
            .with_store(Arc::new(HangingStore))
            .with_clock(Arc::new(ManualClock::default()));
        let config = ResilienceConfig {
            store_timeout_ms: 50,
            ..Default::default()
        };
        let engine = ResilienceEngine::new(parts, config, AccountState::for_user("u-1", "basic"));

        let o = tokio::time::timeout(
            Duration::from_secs(1),
            engine.enable_crisis_mode(OverrideRequest::new("panic", DAY), true),
        )
        .await
        .expect("crisis activation waited on the store")
        .unwrap();
        let state = engine.state().await;
        assert!(state.crisis_mode());
        assert_eq!(state.crisis_override().map(|held| held.id), Some(o.id));
        assert!(engine.generate_resilience_diagnostics().await.pending_writes >= 1);

        tokio::time::timeout(
            Duration::from_secs(1),
            engine.perform_incremental_update(UpdateType::Subscription, tier("premium"), true),
        )
        .await
        .expect("update waited on the store")
        .unwrap();

        // every queued write gives up after the store timeout
        engine.flush_writes().await;
        let diagnostics = engine.generate_resilience_diagnostics().await;
        assert!(diagnostics.health.degraded);
        assert_eq!(diagnostics.pending_writes, 0);
        assert_eq!(diagnostics.journal_write_failures, 1);
        assert_eq!(engine.state().await.tier(), Some("premium"));
        assert!(engine.state().await.crisis_mode());
    }
}
