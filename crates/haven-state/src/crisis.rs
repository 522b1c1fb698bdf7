//! Crisis safety plane
//!
//! Holds every crisis override and the UI-facing crisis flag. Overrides
//! outrank subscription state: nothing outside [`CrisisPlane::retire`]
//! removes an unexpired one, and retiring is refused when it would leave a
//! user in crisis without emergency access.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use haven_core::{
    AccountState, CheckpointId, CrisisOverride, FieldValue, IdSequence, OverrideFlags, OverrideId,
    ResilienceError, ResilienceResult, Timestamp, FIELD_CRISIS_MODE,
};

/// Crisis severity requested by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Low,
    Moderate,
    High,
    Critical,
}

/// App features gated by subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    CrisisButton,
    EmergencyContacts,
    SafetyPlan,
    BreathingExercises,
    MoodTracking,
    Journaling,
    Assessments,
    TherapeuticContent,
    GuidedPrograms,
    TherapistMessaging,
    ProgressInsights,
    DataExport,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::CrisisButton,
        Feature::EmergencyContacts,
        Feature::SafetyPlan,
        Feature::BreathingExercises,
        Feature::MoodTracking,
        Feature::Journaling,
        Feature::Assessments,
        Feature::TherapeuticContent,
        Feature::GuidedPrograms,
        Feature::TherapistMessaging,
        Feature::ProgressInsights,
        Feature::DataExport,
    ];

    /// Available at every level, never restricted
    pub const SAFETY: [Feature; 3] = [
        Feature::CrisisButton,
        Feature::EmergencyContacts,
        Feature::SafetyPlan,
    ];

    pub fn is_safety(self) -> bool {
        Self::SAFETY.contains(&self)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Feature::CrisisButton => "crisis_button",
            Feature::EmergencyContacts => "emergency_contacts",
            Feature::SafetyPlan => "safety_plan",
            Feature::BreathingExercises => "breathing_exercises",
            Feature::MoodTracking => "mood_tracking",
            Feature::Journaling => "journaling",
            Feature::Assessments => "assessments",
            Feature::TherapeuticContent => "therapeutic_content",
            Feature::GuidedPrograms => "guided_programs",
            Feature::TherapistMessaging => "therapist_messaging",
            Feature::ProgressInsights => "progress_insights",
            Feature::DataExport => "data_export",
        };
        f.write_str(s)
    }
}

/// Non-safety features unlocked at each level
fn unlocked(level: SeverityLevel) -> &'static [Feature] {
    match level {
        SeverityLevel::Low => &[Feature::BreathingExercises, Feature::MoodTracking],
        SeverityLevel::Moderate => &[
            Feature::BreathingExercises,
            Feature::MoodTracking,
            Feature::Journaling,
            Feature::Assessments,
            Feature::TherapeuticContent,
        ],
        SeverityLevel::High => &[
            Feature::BreathingExercises,
            Feature::MoodTracking,
            Feature::Journaling,
            Feature::Assessments,
            Feature::TherapeuticContent,
            Feature::GuidedPrograms,
            Feature::TherapistMessaging,
        ],
        SeverityLevel::Critical => &Feature::ALL,
    }
}

/// Result of a continuity check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityReport {
    pub continuity_maintained: bool,
    pub overrides_applied: Vec<OverrideId>,
    pub features_available: Vec<Feature>,
    pub restricted_features: Vec<Feature>,
}

/// Override registry and crisis flag
#[derive(Debug, Default)]
pub struct CrisisPlane {
    overrides: BTreeMap<OverrideId, CrisisOverride>,
    crisis_mode: bool,
    ids: IdSequence,
}

impl CrisisPlane {
    pub fn new() -> Self {
        CrisisPlane {
            overrides: BTreeMap::new(),
            crisis_mode: false,
            ids: IdSequence::new(),
        }
    }

    pub fn next_override_id(&mut self) -> OverrideId {
        OverrideId::new(self.ids.take())
    }

    pub fn install(&mut self, o: CrisisOverride) {
        self.ids.observe(o.id.value());
        tracing::info!(id = ?o.id, expires_at = ?o.expires_at, "crisis override installed");
        self.overrides.insert(o.id, o);
    }

    pub fn enable(&mut self) {
        self.crisis_mode = true;
    }

    /// Clear the UI-facing flag only. Overrides stay.
    pub fn disable(&mut self) {
        self.crisis_mode = false;
    }

    pub fn is_crisis_mode(&self) -> bool {
        self.crisis_mode
    }

    pub fn get(&self, id: OverrideId) -> Option<&CrisisOverride> {
        self.overrides.get(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &CrisisOverride> {
        self.overrides.values()
    }

    pub fn active(&self, now: Timestamp) -> Vec<&CrisisOverride> {
        self.overrides.values().filter(|o| o.is_active(now)).collect()
    }

    pub fn has_active(&self, now: Timestamp) -> bool {
        self.overrides.values().any(|o| o.is_active(now))
    }

    /// Newest unexpired override
    pub fn newest_active(&self, now: Timestamp) -> Option<&CrisisOverride> {
        self.overrides.values().rev().find(|o| o.is_active(now))
    }

    pub fn set_checkpoint_ref(&mut self, id: OverrideId, checkpoint: CheckpointId) {
        if let Some(o) = self.overrides.get_mut(&id) {
            o.checkpoint_ref = Some(checkpoint);
        }
    }

    /// Checkpoints referenced by unexpired overrides
    pub fn protected_checkpoints(&self, now: Timestamp) -> BTreeSet<CheckpointId> {
        self.overrides
            .values()
            .filter(|o| o.is_active(now))
            .filter_map(|o| o.checkpoint_ref)
            .collect()
    }

    /// Remove an override before it expires.
    ///
    /// Refused while crisis mode is on unless another active override still
    /// grants emergency access.
    pub fn retire(&mut self, id: OverrideId, now: Timestamp) -> ResilienceResult<CrisisOverride> {
        let target = self
            .overrides
            .get(&id)
            .ok_or(ResilienceError::OverrideNotFound(id))?;

        if self.crisis_mode && target.is_active(now) {
            let covered = self
                .overrides
                .values()
                .any(|o| o.id != id && o.grants_emergency_access(now));
            if !covered {
                return Err(ResilienceError::CrisisSafetyViolation(format!(
                    "retiring {:?} leaves crisis mode without emergency access",
                    id
                )));
            }
        }

        let removed = self
            .overrides
            .remove(&id)
            .ok_or(ResilienceError::OverrideNotFound(id))?;
        tracing::info!(id = ?id, "crisis override retired");
        Ok(removed)
    }

    /// Drop expired overrides. Returns their ids.
    pub fn purge_expired(&mut self, now: Timestamp) -> Vec<OverrideId> {
        let expired: Vec<OverrideId> = self
            .overrides
            .values()
            .filter(|o| !o.is_active(now))
            .map(|o| o.id)
            .collect();
        for id in &expired {
            self.overrides.remove(id);
        }
        expired
    }

    /// Install a full-access override for `duration`
    pub fn emergency_override(&mut self, now: Timestamp, duration: Duration) -> CrisisOverride {
        let o = CrisisOverride::new(
            self.next_override_id(),
            "emergency fallback",
            now,
            now.saturating_add(duration),
            OverrideFlags::FULL,
        );
        tracing::warn!(id = ?o.id, "emergency override engaged");
        self.install(o.clone());
        o
    }

    /// Reset. With `preserve`, unexpired overrides and the crisis flag
    /// survive.
    pub fn clear(&mut self, preserve: bool, now: Timestamp) {
        if preserve {
            self.purge_expired(now);
            if self.overrides.is_empty() {
                self.crisis_mode = false;
            }
        } else {
            self.overrides.clear();
            self.crisis_mode = false;
        }
    }

    /// Write the plane into `state`: crisis flag and the newest active
    /// override with its access grants.
    pub fn mirror_into(&self, state: &mut AccountState, now: Timestamp) {
        if self.crisis_mode {
            state.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        }
        if let Some(o) = self.newest_active(now) {
            state.apply_override(o);
        }
    }

    /// Whether `state` keeps every active override in place
    pub fn is_preserved_in(&self, state: &AccountState, now: Timestamp) -> bool {
        match self.newest_active(now) {
            None => true,
            Some(o) => state.crisis_override().map_or(false, |held| {
                held.is_active(now) && (held.id == o.id || self.overrides.contains_key(&held.id))
            }),
        }
    }

    /// Severity to feature allowlist. Critical installs an emergency
    /// override when none is active.
    pub fn ensure_continuity(
        &mut self,
        level: SeverityLevel,
        now: Timestamp,
        emergency_duration: Duration,
    ) -> ContinuityReport {
        if level == SeverityLevel::Critical && !self.has_active(now) {
            self.emergency_override(now, emergency_duration);
        }

        let active = self.active(now);
        let bypass = self.crisis_mode || active.iter().any(|o| o.flags.bypass_subscription);
        let overrides_applied: Vec<OverrideId> = active.iter().map(|o| o.id).collect();

        let features_available: Vec<Feature> = Feature::ALL
            .iter()
            .copied()
            .filter(|f| bypass || f.is_safety() || unlocked(level).contains(f))
            .collect();
        let restricted_features: Vec<Feature> = Feature::ALL
            .iter()
            .copied()
            .filter(|f| !features_available.contains(f))
            .collect();

        let continuity_maintained = Feature::SAFETY
            .iter()
            .all(|f| features_available.contains(f))
            && (level < SeverityLevel::Critical || !overrides_applied.is_empty());

        ContinuityReport {
            continuity_maintained,
            overrides_applied,
            features_available,
            restricted_features,
        }
    }
}
