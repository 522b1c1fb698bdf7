//! Recovery coordination
//!
//! Turns a corruption report into a restored state. Recovery never removes
//! an active override: every candidate has the safety plane mirrored back
//! into it, and when no candidate restores crisis safety the plane's
//! emergency override is engaged instead.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use haven_core::{field_spec, AccountState, CheckpointId, FieldValue, ReportId, Revision, Timestamp};
use haven_crypto::EncryptionAdapter;

use crate::{
    apply_updates, validate_updates, CheckpointManager, CorruptionDetector, CorruptionReport,
    CrisisPlane, Journal, WriteLedger,
};

/// Recovery strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    #[default]
    CheckpointRollback,
    PartialFieldRepair,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub duration: Duration,
    pub checkpoints_examined: usize,
    pub fields_repaired: usize,
    pub journal_entries_replayed: usize,
}

/// Record of one recovery attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOperation {
    pub report_id: ReportId,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    pub checkpoints_used: Vec<CheckpointId>,
    pub data_loss: bool,
    pub emergency_fallback: bool,
    pub metrics: RecoveryMetrics,
}

/// Everything a recovery pass reads, plus the plane it may extend
pub struct RecoveryInputs<'a> {
    pub report: &'a CorruptionReport,
    pub current: &'a AccountState,
    pub checkpoints: &'a CheckpointManager,
    pub journal: &'a Journal,
    pub ledger: &'a WriteLedger,
    pub plane: &'a mut CrisisPlane,
    pub adapter: &'a dyn EncryptionAdapter,
    pub now: Timestamp,
    pub emergency_duration: Duration,
}

/// Operation record plus the state to commit, if any
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub operation: RecoveryOperation,
    pub restored: Option<AccountState>,
}

/// Plans and executes recovery against in-memory components
#[derive(Debug, Default)]
pub struct RecoveryCoordinator {
    detector: CorruptionDetector,
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        RecoveryCoordinator::default()
    }

    pub fn recover(&self, strategy: RecoveryStrategy, inputs: RecoveryInputs<'_>) -> RecoveryOutcome {
        let started = Instant::now();
        let mut outcome = match strategy {
            RecoveryStrategy::CheckpointRollback => self.rollback(inputs),
            RecoveryStrategy::PartialFieldRepair => self.repair(inputs),
            RecoveryStrategy::Manual => RecoveryOutcome {
                operation: operation(inputs.report, strategy, RecoveryStatus::Pending),
                restored: None,
            },
        };
        outcome.operation.metrics.duration = started.elapsed();
        outcome
    }

    fn rollback(&self, inputs: RecoveryInputs<'_>) -> RecoveryOutcome {
        let RecoveryInputs {
            report,
            current,
            checkpoints,
            journal,
            ledger,
            plane,
            adapter,
            now,
            emergency_duration,
        } = inputs;

        let mut op = operation(report, RecoveryStrategy::CheckpointRollback, RecoveryStatus::Failed);
        let overrides_active = plane.has_active(now);
        let prefer_crisis = report.crisis_impact || overrides_active;

        // First clean candidate that does not restore crisis safety, kept in
        // case nothing better turns up.
        let mut fallback: Option<(CheckpointId, AccountState, Revision, usize)> = None;

        for id in checkpoints.candidates_newest_first(prefer_crisis) {
            op.metrics.checkpoints_examined += 1;

            let mut candidate = match checkpoints.open(id, adapter, false) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(checkpoint = ?id, error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            let covered = match checkpoints.get(id) {
                Some(c) => c.metadata.revision,
                None => continue,
            };

            let replayed = replay_journal(&mut candidate, journal, covered, overrides_active);
            plane.mirror_into(&mut candidate, now);

            if !self.detector.is_clean(&candidate) {
                continue;
            }
            if report.crisis_impact && !is_crisis_safe(&candidate) {
                if fallback.is_none() {
                    fallback = Some((id, candidate, covered, replayed));
                }
                continue;
            }

            op.status = RecoveryStatus::Completed;
            op.checkpoints_used.push(id);
            op.metrics.journal_entries_replayed = replayed;
            op.data_loss = !ledger.dropped_fields(covered, &candidate, None).is_empty();
            tracing::info!(checkpoint = ?id, data_loss = op.data_loss, "rollback restored state");
            return RecoveryOutcome {
                operation: op,
                restored: Some(candidate),
            };
        }

        if !report.crisis_impact {
            tracing::warn!(report = ?report.id, "no clean checkpoint to roll back to");
            return RecoveryOutcome {
                operation: op,
                restored: None,
            };
        }

        let (mut restored, covered) = match fallback {
            Some((id, state, covered, replayed)) => {
                op.checkpoints_used.push(id);
                op.metrics.journal_entries_replayed = replayed;
                (state, covered)
            }
            None => (current.clone(), ledger.newest_revision()),
        };
        engage_emergency_fallback(plane, &mut restored, now, emergency_duration);
        op.emergency_fallback = true;
        op.data_loss = !ledger.dropped_fields(covered, &restored, None).is_empty();
        op.status = if self.detector.is_clean(&restored) {
            RecoveryStatus::Completed
        } else {
            RecoveryStatus::Failed
        };

        RecoveryOutcome {
            operation: op,
            restored: Some(restored),
        }
    }

    fn repair(&self, inputs: RecoveryInputs<'_>) -> RecoveryOutcome {
        let RecoveryInputs {
            report,
            current,
            checkpoints,
            journal,
            ledger,
            plane,
            adapter,
            now,
            emergency_duration,
        } = inputs;

        let mut op = operation(report, RecoveryStrategy::PartialFieldRepair, RecoveryStatus::Failed);
        let mut restored = current.clone();

        // Decrypt each checkpoint once, newest first
        let mut opened: Vec<(CheckpointId, Revision, AccountState)> = Vec::new();
        for id in checkpoints.candidates_newest_first(false) {
            op.metrics.checkpoints_examined += 1;
            let (Some(c), Ok(state)) = (checkpoints.get(id), checkpoints.open(id, adapter, false))
            else {
                continue;
            };
            opened.push((id, c.metadata.revision, state));
        }

        for field in &report.affected_fields {
            let from_journal = journal
                .latest_for_field(field, Revision::ZERO)
                .filter(|(_, v)| valid_value(field, v))
                .map(|(rev, v)| (rev, v.clone(), None));
            let from_checkpoint = opened.iter().find_map(|(id, rev, state)| {
                state
                    .get(field)
                    .filter(|v| valid_value(field, v))
                    .map(|v| (*rev, v.clone(), Some(*id)))
            });

            let best = match (from_journal, from_checkpoint) {
                (Some(j), Some(c)) => Some(if j.0 > c.0 { j } else { c }),
                (j, c) => j.or(c),
            };
            if let Some((_, value, source)) = best {
                restored.set(field, value);
                op.metrics.fields_repaired += 1;
                if let Some(id) = source {
                    if !op.checkpoints_used.contains(&id) {
                        op.checkpoints_used.push(id);
                    }
                }
            }
        }

        plane.mirror_into(&mut restored, now);
        if report.crisis_impact && !is_crisis_safe(&restored) {
            engage_emergency_fallback(plane, &mut restored, now, emergency_duration);
            op.emergency_fallback = true;
        }

        op.data_loss = !ledger
            .dropped_fields(Revision::ZERO, &restored, Some(&report.affected_fields))
            .is_empty();

        if self.detector.is_clean(&restored) {
            op.status = RecoveryStatus::Completed;
        }
        let restored = if op.status == RecoveryStatus::Completed || op.emergency_fallback {
            Some(restored)
        } else {
            None
        };
        RecoveryOutcome {
            operation: op,
            restored,
        }
    }
}

/// Install an emergency override and make `state` consistent with it
pub fn engage_emergency_fallback(
    plane: &mut CrisisPlane,
    state: &mut AccountState,
    now: Timestamp,
    duration: Duration,
) {
    let o = match plane.newest_active(now) {
        Some(o) => o.clone(),
        None => plane.emergency_override(now, duration),
    };
    plane.enable();
    state.set(haven_core::FIELD_CRISIS_MODE, FieldValue::Bool(true));
    state.apply_override(&o);
}

fn operation(
    report: &CorruptionReport,
    strategy: RecoveryStrategy,
    status: RecoveryStatus,
) -> RecoveryOperation {
    RecoveryOperation {
        report_id: report.id,
        strategy,
        status,
        checkpoints_used: Vec::new(),
        data_loss: false,
        emergency_fallback: false,
        metrics: RecoveryMetrics::default(),
    }
}

/// Re-apply journal entries newer than `covered` that still validate
fn replay_journal(
    state: &mut AccountState,
    journal: &Journal,
    covered: Revision,
    overrides_active: bool,
) -> usize {
    let mut replayed = 0;
    for entry in journal.entries_after(covered) {
        if !entry.verify() {
            tracing::warn!(update = ?entry.id, "journal entry checksum mismatch, skipped");
            continue;
        }
        if validate_updates(&entry.field_updates, overrides_active).is_err() {
            continue;
        }
        apply_updates(state, &entry.field_updates);
        replayed += 1;
    }
    replayed
}

fn is_crisis_safe(state: &AccountState) -> bool {
    state.crisis_mode() && state.crisis_override().is_some()
}

fn valid_value(field: &str, value: &FieldValue) -> bool {
    match field_spec(field) {
        Some(spec) => value.kind() == spec.kind,
        None => !value.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detect_corruption, CheckpointContext, FieldUpdate, IncrementalUpdate, OperationType,
        UpdateType,
    };
    use haven_core::{
        CrisisOverride, OverrideFlags, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE, FIELD_TIER,
    };
    use haven_crypto::ChaChaAdapter;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Fixture {
        adapter: ChaChaAdapter,
        checkpoints: CheckpointManager,
        journal: Journal,
        ledger: WriteLedger,
        plane: CrisisPlane,
        state: AccountState,
        revision: Revision,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fixture = Fixture {
                adapter: ChaChaAdapter::generate(),
                checkpoints: CheckpointManager::new(),
                journal: Journal::new(),
                ledger: WriteLedger::new(),
                plane: CrisisPlane::new(),
                state: AccountState::new(),
                revision: Revision::ZERO,
            };
            let initial = AccountState::for_user("u-1", "basic");
            fixture.commit(initial);
            fixture
        }

        fn commit(&mut self, next: AccountState) {
            self.revision = self.revision.next();
            self.ledger.record_diff(self.revision, &self.state, &next);
            self.state = next;
        }

        fn checkpoint(&mut self, op: &str) -> CheckpointId {
            self.checkpoints
                .create(
                    &self.adapter,
                    &self.state,
                    &CheckpointContext::new(OperationType::Manual, op),
                    Timestamp::ZERO,
                    self.revision,
                )
                .unwrap()
                .id
        }

        fn update_tier(&mut self, tier: &str, persist: bool) {
            let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::text(tier))];
            let mut next = self.state.clone();
            apply_updates(&mut next, &updates);
            self.commit(next);
            if persist {
                let id = self.journal.next_id();
                self.journal.append(IncrementalUpdate::new(
                    id,
                    UpdateType::Subscription,
                    updates,
                    self.revision,
                    Timestamp::ZERO,
                ));
            }
        }

        fn recover(&mut self, strategy: RecoveryStrategy) -> RecoveryOutcome {
            let report = detect_corruption(&self.state, Timestamp::ZERO).unwrap();
            RecoveryCoordinator::new().recover(
                strategy,
                RecoveryInputs {
                    report: &report,
                    current: &self.state,
                    checkpoints: &self.checkpoints,
                    journal: &self.journal,
                    ledger: &self.ledger,
                    plane: &mut self.plane,
                    adapter: &self.adapter,
                    now: Timestamp::ZERO,
                    emergency_duration: DAY,
                },
            )
        }
    }

    #[test]
    fn test_rollback_replays_journal() {
        let mut f = Fixture::new();
        f.checkpoint("base");
        f.update_tier("premium", true);
        f.state.remove(FIELD_TIER);

        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        assert_eq!(outcome.operation.status, RecoveryStatus::Completed);
        assert!(!outcome.operation.data_loss);
        assert_eq!(outcome.operation.metrics.journal_entries_replayed, 1);
        assert_eq!(outcome.restored.unwrap().tier(), Some("premium"));
    }

    #[test]
    fn test_rollback_without_journal_reports_loss() {
        let mut f = Fixture::new();
        f.checkpoint("base");
        f.update_tier("premium", false);
        f.state.remove(FIELD_TIER);

        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        assert_eq!(outcome.operation.status, RecoveryStatus::Completed);
        assert!(outcome.operation.data_loss);
        assert_eq!(outcome.restored.unwrap().tier(), Some("basic"));
    }

    #[test]
    fn test_rollback_without_checkpoints_fails() {
        let mut f = Fixture::new();
        f.state.remove(FIELD_TIER);

        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        assert_eq!(outcome.operation.status, RecoveryStatus::Failed);
        assert!(outcome.restored.is_none());
    }

    #[test]
    fn test_rollback_keeps_active_override() {
        let mut f = Fixture::new();
        f.checkpoint("before-crisis");

        let o = f.plane.emergency_override(Timestamp::ZERO, DAY);
        f.plane.enable();
        let mut next = f.state.clone();
        next.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        next.apply_override(&o);
        f.commit(next);

        f.state.remove(FIELD_TIER);
        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        let restored = outcome.restored.unwrap();
        assert_eq!(restored.crisis_override().map(|x| x.id), Some(o.id));
        assert!(restored.crisis_mode());
        assert!(!outcome.operation.emergency_fallback);
    }

    #[test]
    fn test_crisis_corruption_without_safe_candidate_engages_fallback() {
        let mut f = Fixture::new();
        f.checkpoint("plain");

        let mut next = f.state.clone();
        next.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        next.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
        f.state = next;

        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        assert!(outcome.operation.emergency_fallback);
        assert_eq!(outcome.operation.status, RecoveryStatus::Completed);
        let restored = outcome.restored.unwrap();
        assert!(restored.crisis_mode());
        assert!(restored.crisis_override().is_some());
        assert!(f.plane.has_active(Timestamp::ZERO));
    }

    #[test]
    fn test_crisis_checkpoint_preferred() {
        let mut f = Fixture::new();
        let o = CrisisOverride::new(
            f.plane.next_override_id(),
            "panic",
            Timestamp::ZERO,
            Timestamp::ZERO + DAY,
            OverrideFlags::FULL,
        );
        let mut crisis = f.state.clone();
        crisis.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        crisis.apply_override(&o);
        f.commit(crisis);
        let safe = f.checkpoint("crisis");

        // the plane never installed this override; only the snapshot holds it
        let mut later = f.state.clone();
        later.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
        f.state = later;

        let outcome = f.recover(RecoveryStrategy::CheckpointRollback);
        assert_eq!(outcome.operation.checkpoints_used, vec![safe]);
        assert!(!outcome.operation.emergency_fallback);
    }

    #[test]
    fn test_partial_repair_touches_only_affected_fields() {
        let mut f = Fixture::new();
        f.checkpoint("base");
        let mut next = f.state.clone();
        next.set("theme", FieldValue::text("dark"));
        f.commit(next);
        f.state.remove(FIELD_TIER);

        let outcome = f.recover(RecoveryStrategy::PartialFieldRepair);
        assert_eq!(outcome.operation.status, RecoveryStatus::Completed);
        assert_eq!(outcome.operation.metrics.fields_repaired, 1);
        let restored = outcome.restored.unwrap();
        assert_eq!(restored.tier(), Some("basic"));
        assert_eq!(restored.get("theme"), Some(&FieldValue::text("dark")));
    }

    #[test]
    fn test_partial_repair_prefers_newer_journal_value() {
        let mut f = Fixture::new();
        f.checkpoint("base");
        f.update_tier("family", true);
        f.state.set(FIELD_TIER, FieldValue::Int(0));

        let outcome = f.recover(RecoveryStrategy::PartialFieldRepair);
        assert!(!outcome.operation.data_loss);
        assert_eq!(outcome.restored.unwrap().tier(), Some("family"));
    }

    #[test]
    fn test_manual_is_pending() {
        let mut f = Fixture::new();
        f.checkpoint("base");
        f.state.remove(FIELD_TIER);

        let outcome = f.recover(RecoveryStrategy::Manual);
        assert_eq!(outcome.operation.status, RecoveryStatus::Pending);
        assert!(outcome.restored.is_none());
    }
}
