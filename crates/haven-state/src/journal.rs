//! Incremental update journal
//!
//! Field-level diffs are validated as a batch, applied atomically and, when
//! persisted, appended to the journal with an order-dependent checksum.
//! The write ledger sits beside the journal and remembers the newest valid
//! value of every field, journaled or not, so recovery can tell whether a
//! restore dropped a committed write.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use haven_core::{
    field_spec, AccountState, FieldKind, FieldValue, IdSequence, ResilienceError, ResilienceResult,
    Revision, Timestamp, UpdateId, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE,
};
use haven_crypto::{ChainedChecksum, Checksum};

/// Kind of incremental update
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Subscription,
    Status,
    Crisis,
    Profile,
    Sync,
}

/// One field diff
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub old_value: Option<FieldValue>,
    pub new_value: FieldValue,
    pub validation_passed: bool,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, new_value: FieldValue) -> Self {
        FieldUpdate {
            field: field.into(),
            old_value: None,
            new_value,
            validation_passed: true,
        }
    }

    pub fn with_old(mut self, old_value: FieldValue) -> Self {
        self.old_value = Some(old_value);
        self
    }

    fn checksum_item(&self) -> Vec<u8> {
        let mut item = Vec::with_capacity(self.field.len() + 16);
        item.extend_from_slice(&(self.field.len() as u32).to_le_bytes());
        item.extend_from_slice(self.field.as_bytes());
        match &self.old_value {
            Some(old) => {
                item.push(1);
                item.extend_from_slice(&old.canonical_bytes());
            }
            None => item.push(0),
        }
        item.extend_from_slice(&self.new_value.canonical_bytes());
        item
    }

    /// Whether applying this diff would take crisis safety away
    fn reduces_crisis_safety(&self) -> bool {
        let Some(spec) = field_spec(&self.field) else {
            return false;
        };
        if !spec.crisis_sensitive {
            return false;
        }
        match spec.kind {
            FieldKind::Override => self.new_value.as_override().is_none(),
            FieldKind::Bool => self.new_value.as_bool() != Some(true),
            _ => false,
        }
    }
}

/// A journaled batch of field diffs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalUpdate {
    pub id: UpdateId,
    pub update_type: UpdateType,
    pub field_updates: Vec<FieldUpdate>,
    pub checksum: Checksum,
    pub revision: Revision,
    pub created_at: Timestamp,
}

impl IncrementalUpdate {
    pub fn new(
        id: UpdateId,
        update_type: UpdateType,
        field_updates: Vec<FieldUpdate>,
        revision: Revision,
        created_at: Timestamp,
    ) -> Self {
        let checksum = update_checksum(&field_updates);
        IncrementalUpdate {
            id,
            update_type,
            field_updates,
            checksum,
            revision,
            created_at,
        }
    }

    pub fn verify(&self) -> bool {
        update_checksum(&self.field_updates) == self.checksum
    }

    pub fn touches(&self, field: &str) -> bool {
        self.field_updates.iter().any(|u| u.field == field)
    }
}

/// Order-dependent checksum over a list of diffs
pub fn update_checksum(updates: &[FieldUpdate]) -> Checksum {
    let mut chained = ChainedChecksum::new();
    for update in updates {
        chained.update(&update.checksum_item());
    }
    chained.finalize()
}

/// Validate a batch before anything is applied.
///
/// `overrides_active` is whether the safety plane holds an unexpired
/// override; while it does, no entry may reduce crisis safety.
pub fn validate_updates(updates: &[FieldUpdate], overrides_active: bool) -> ResilienceResult<()> {
    if updates.is_empty() {
        return Err(ResilienceError::validation("", "no field updates"));
    }

    for update in updates {
        if update.field.trim().is_empty() {
            return Err(ResilienceError::validation("", "empty field name"));
        }
        if !update.validation_passed {
            return Err(ResilienceError::validation(
                &update.field,
                "entry did not pass validation",
            ));
        }
        if let Some(spec) = field_spec(&update.field) {
            let kind = update.new_value.kind();
            if kind == FieldKind::Null && !spec.nullable {
                return Err(ResilienceError::validation(&update.field, "field is not nullable"));
            }
            if kind != FieldKind::Null && kind != spec.kind {
                return Err(ResilienceError::validation(
                    &update.field,
                    format!("expected {}, found {}", spec.kind, kind),
                ));
            }
        }
    }

    if overrides_active {
        if let Some(update) = updates.iter().find(|u| u.reduces_crisis_safety()) {
            let what = match update.field.as_str() {
                FIELD_CRISIS_MODE => "cannot disable crisis mode".to_string(),
                FIELD_CRISIS_OVERRIDE => "cannot remove crisis override".to_string(),
                other => format!("cannot revoke {}", other),
            };
            return Err(ResilienceError::CrisisSafetyViolation(format!(
                "{} while overrides are active",
                what
            )));
        }
    }

    Ok(())
}

/// Apply a validated batch
pub fn apply_updates(state: &mut AccountState, updates: &[FieldUpdate]) {
    for update in updates {
        state.set(&update.field, update.new_value.clone());
    }
}

/// In-memory journal
#[derive(Debug, Default)]
pub struct Journal {
    entries: BTreeMap<UpdateId, IncrementalUpdate>,
    persisted: BTreeSet<UpdateId>,
    ids: IdSequence,
    consecutive_failures: u32,
    total_failures: u64,
}

impl Journal {
    pub fn new() -> Self {
        Journal {
            ids: IdSequence::new(),
            ..Default::default()
        }
    }

    pub fn next_id(&mut self) -> UpdateId {
        UpdateId::new(self.ids.take())
    }

    pub fn append(&mut self, update: IncrementalUpdate) {
        self.entries.insert(update.id, update);
    }

    pub fn get(&self, id: UpdateId) -> Option<&IncrementalUpdate> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Durable write confirmed
    pub fn mark_persisted(&mut self, id: UpdateId) {
        self.persisted.insert(id);
        self.consecutive_failures = 0;
    }

    pub fn is_persisted(&self, id: UpdateId) -> bool {
        self.persisted.contains(&id)
    }

    /// Durable write failed. Only feeds health diagnostics.
    pub fn record_write_failure(&mut self) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Entries newer than `revision`, oldest first
    pub fn entries_after(&self, revision: Revision) -> Vec<&IncrementalUpdate> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.revision > revision)
            .collect();
        entries.sort_by_key(|e| e.revision);
        entries
    }

    /// Newest journaled value for `field` written after `revision`
    pub fn latest_for_field(&self, field: &str, revision: Revision) -> Option<(Revision, &FieldValue)> {
        self.entries
            .values()
            .filter(|e| e.revision > revision)
            .flat_map(|e| {
                e.field_updates
                    .iter()
                    .filter(|u| u.field == field)
                    .map(move |u| (e.revision, &u.new_value))
            })
            .max_by_key(|(rev, _)| *rev)
    }

    /// Drop entries at or below `revision`. Returns the removed ids.
    pub fn prune_through(&mut self, revision: Revision) -> Vec<UpdateId> {
        let doomed: Vec<UpdateId> = self
            .entries
            .values()
            .filter(|e| e.revision <= revision)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            self.entries.remove(id);
            self.persisted.remove(id);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persisted.clear();
        self.consecutive_failures = 0;
    }
}

/// Newest committed valid value per field
#[derive(Clone, Debug, Default)]
pub struct WriteLedger {
    latest: BTreeMap<String, (Revision, FieldValue)>,
    newest: Revision,
}

impl WriteLedger {
    pub fn new() -> Self {
        WriteLedger::default()
    }

    /// Record every field of `after` that changed from `before`
    pub fn record_diff(&mut self, revision: Revision, before: &AccountState, after: &AccountState) {
        for (field, value) in &after.fields {
            if before.get(field) != Some(value) {
                self.record(revision, field, value);
            }
        }
        self.newest = self.newest.max(revision);
    }

    /// Record a single write. Nulls and schema-invalid values are not
    /// data anyone could lose.
    pub fn record(&mut self, revision: Revision, field: &str, value: &FieldValue) {
        self.newest = self.newest.max(revision);
        if value.is_null() {
            return;
        }
        if let Some(spec) = field_spec(field) {
            if value.kind() != spec.kind {
                return;
            }
        }
        self.latest
            .insert(field.to_string(), (revision, value.clone()));
    }

    pub fn newest_revision(&self) -> Revision {
        self.newest
    }

    /// Fields written after `covered` whose newest value `restored` does
    /// not hold. `only` narrows the check to a set of fields.
    pub fn dropped_fields(
        &self,
        covered: Revision,
        restored: &AccountState,
        only: Option<&[String]>,
    ) -> Vec<String> {
        self.latest
            .iter()
            .filter(|(field, _)| only.map_or(true, |set| set.iter().any(|f| f == *field)))
            .filter(|(field, (rev, value))| *rev > covered && restored.get(field) != Some(value))
            .map(|(field, _)| field.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.latest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::{CrisisOverride, OverrideFlags, OverrideId, FIELD_TIER};

    #[test]
    fn test_empty_field_name_rejected() {
        let updates = vec![FieldUpdate::new("", FieldValue::text("premium"))];
        assert!(matches!(
            validate_updates(&updates, false),
            Err(ResilienceError::Validation { .. })
        ));
    }

    #[test]
    fn test_failed_entry_rejects_whole_batch() {
        let mut bad = FieldUpdate::new("status", FieldValue::text("active"));
        bad.validation_passed = false;
        let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::text("premium")), bad];
        assert!(validate_updates(&updates, false).is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::Int(2))];
        assert!(validate_updates(&updates, false).is_err());

        let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::Null)];
        assert!(validate_updates(&updates, false).is_err());
    }

    #[test]
    fn test_disabling_crisis_with_active_override() {
        let updates = vec![FieldUpdate::new(FIELD_CRISIS_MODE, FieldValue::Bool(false))];
        assert!(matches!(
            validate_updates(&updates, true),
            Err(ResilienceError::CrisisSafetyViolation(_))
        ));
        assert!(validate_updates(&updates, false).is_ok());

        let updates = vec![FieldUpdate::new(FIELD_CRISIS_OVERRIDE, FieldValue::Null)];
        assert!(validate_updates(&updates, true).unwrap_err().is_safety_violation());

        let o = CrisisOverride::new(
            OverrideId::new(2),
            "x",
            Timestamp::ZERO,
            Timestamp::MAX,
            OverrideFlags::FULL,
        );
        let updates = vec![FieldUpdate::new(FIELD_CRISIS_OVERRIDE, FieldValue::from(o))];
        assert!(validate_updates(&updates, true).is_ok());
    }

    #[test]
    fn test_checksum_is_order_dependent() {
        let a = FieldUpdate::new(FIELD_TIER, FieldValue::text("premium"));
        let b = FieldUpdate::new("status", FieldValue::text("active"));
        assert_ne!(
            update_checksum(&[a.clone(), b.clone()]),
            update_checksum(&[b, a])
        );
    }

    #[test]
    fn test_entries_after_and_latest() {
        let mut journal = Journal::new();
        for (rev, tier) in [(2, "basic"), (4, "premium"), (6, "family")] {
            let id = journal.next_id();
            journal.append(IncrementalUpdate::new(
                id,
                UpdateType::Subscription,
                vec![FieldUpdate::new(FIELD_TIER, FieldValue::text(tier))],
                Revision(rev),
                Timestamp::ZERO,
            ));
        }

        assert_eq!(journal.entries_after(Revision(3)).len(), 2);
        let (rev, value) = journal.latest_for_field(FIELD_TIER, Revision(0)).unwrap();
        assert_eq!(rev, Revision(6));
        assert_eq!(value, &FieldValue::text("family"));

        assert_eq!(journal.prune_through(Revision(4)).len(), 2);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_failure_counter_resets_on_success() {
        let mut journal = Journal::new();
        journal.record_write_failure();
        journal.record_write_failure();
        assert_eq!(journal.consecutive_failures(), 2);
        let id = journal.next_id();
        journal.mark_persisted(id);
        assert_eq!(journal.consecutive_failures(), 0);
        assert_eq!(journal.total_failures(), 2);
    }

    #[test]
    fn test_ledger_dropped_fields() {
        let before = AccountState::for_user("u-1", "basic");
        let mut after = before.clone();
        after.set(FIELD_TIER, FieldValue::text("premium"));

        let mut ledger = WriteLedger::new();
        ledger.record_diff(Revision(2), &before, &after);

        assert_eq!(ledger.dropped_fields(Revision(1), &before, None), vec![FIELD_TIER]);
        assert!(ledger.dropped_fields(Revision(1), &after, None).is_empty());
        assert!(ledger.dropped_fields(Revision(2), &before, None).is_empty());
    }

    #[test]
    fn test_ledger_ignores_invalid_values() {
        let mut ledger = WriteLedger::new();
        ledger.record(Revision(3), FIELD_TIER, &FieldValue::Int(9));
        let state = AccountState::for_user("u-1", "basic");
        assert!(ledger.dropped_fields(Revision(1), &state, None).is_empty());
        assert_eq!(ledger.newest_revision(), Revision(3));
    }
}
