//! Cross-device conflict detection and resolution
//!
//! Devices report what they believe the salient account fields are. Any
//! disagreement within a field family becomes one pending conflict. A
//! resolution picks a winning device, but it is never committed if the
//! winning fragment would revoke an active crisis override.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use haven_core::{
    salient_fields, AccountState, ConflictFamily, ConflictId, CrisisOverride, DeviceId, FieldValue,
    IdSequence, ResilienceError, ResilienceResult, Timestamp, FIELD_CRISIS_MODE,
    FIELD_CRISIS_OVERRIDE, FIELD_EMERGENCY_ACCESS, FIELD_THERAPEUTIC_ACCESS,
};

use crate::CrisisPlane;

/// One device's view of the salient fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceObservation {
    pub device_id: DeviceId,
    pub last_sync_time: Timestamp,
    /// Monotonic per device
    pub sync_counter: u64,
    pub state_fragment: BTreeMap<String, FieldValue>,
    /// Clamped to 0..=1
    pub confidence: f64,
}

impl DeviceObservation {
    pub fn new(
        device_id: impl Into<DeviceId>,
        last_sync_time: Timestamp,
        sync_counter: u64,
        confidence: f64,
    ) -> Self {
        DeviceObservation {
            device_id: device_id.into(),
            last_sync_time,
            sync_counter,
            state_fragment: BTreeMap::new(),
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn with_field(mut self, field: &str, value: FieldValue) -> Self {
        self.state_fragment.insert(field.to_string(), value);
        self
    }

    /// Fragment shows crisis mode or holds an unexpired override
    pub fn carries_crisis_impact(&self, now: Timestamp) -> bool {
        let crisis = self
            .state_fragment
            .get(FIELD_CRISIS_MODE)
            .and_then(FieldValue::as_bool)
            .unwrap_or(false);
        crisis || self.active_override(now).is_some()
    }

    pub fn active_override(&self, now: Timestamp) -> Option<&CrisisOverride> {
        self.state_fragment
            .get(FIELD_CRISIS_OVERRIDE)
            .and_then(FieldValue::as_override)
            .filter(|o| o.is_active(now))
    }

    fn in_crisis_with_override(&self, now: Timestamp) -> bool {
        let crisis = self
            .state_fragment
            .get(FIELD_CRISIS_MODE)
            .and_then(FieldValue::as_bool)
            .unwrap_or(false);
        crisis && self.active_override(now).is_some()
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SubscriptionMismatch,
    StatusMismatch,
    CrisisStateMismatch,
}

impl From<ConflictFamily> for ConflictType {
    fn from(family: ConflictFamily) -> Self {
        match family {
            ConflictFamily::Subscription => ConflictType::SubscriptionMismatch,
            ConflictFamily::Status => ConflictType::StatusMismatch,
            ConflictFamily::Crisis => ConflictType::CrisisStateMismatch,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    LastWriterWins,
    HighestConfidence,
    Manual,
}

/// Divergence in one field family
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub detected_at: Timestamp,
    pub conflict_type: ConflictType,
    pub fields: Vec<String>,
    pub device_observations: Vec<DeviceObservation>,
    pub resolution_strategy: ResolutionStrategy,
    pub crisis_impact: bool,
    pub auto_resolvable: bool,
}

impl Conflict {
    pub fn devices(&self) -> BTreeSet<&DeviceId> {
        self.device_observations.iter().map(|o| &o.device_id).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMetrics {
    pub duration: Duration,
    pub observations_compared: usize,
}

/// Committed resolution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: ConflictId,
    pub resolved_at: Timestamp,
    pub strategy: ResolutionStrategy,
    pub winning_device: DeviceId,
    pub winning_state: BTreeMap<String, FieldValue>,
    pub devices_updated: Vec<DeviceId>,
    pub metrics: ResolutionMetrics,
}

/// Last-writer-wins order: sync time, then confidence, then sync counter,
/// then the lowest device id.
pub fn lww_order(a: &DeviceObservation, b: &DeviceObservation) -> Ordering {
    a.last_sync_time
        .cmp(&b.last_sync_time)
        .then_with(|| a.confidence.total_cmp(&b.confidence))
        .then_with(|| a.sync_counter.cmp(&b.sync_counter))
        .then_with(|| b.device_id.cmp(&a.device_id))
}

fn confidence_order(a: &DeviceObservation, b: &DeviceObservation) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then_with(|| lww_order(a, b))
}

/// Pick the winning observation for a strategy. `None` for manual.
pub fn pick_winner(
    observations: &[DeviceObservation],
    strategy: ResolutionStrategy,
) -> Option<&DeviceObservation> {
    match strategy {
        ResolutionStrategy::LastWriterWins => observations.iter().max_by(|a, b| lww_order(a, b)),
        ResolutionStrategy::HighestConfidence => {
            observations.iter().max_by(|a, b| confidence_order(a, b))
        }
        ResolutionStrategy::Manual => None,
    }
}

/// Why committing `winner` would take away crisis safety, if it would
fn revocation(
    winner: &DeviceId,
    fragment: &BTreeMap<String, FieldValue>,
    participants: &[DeviceObservation],
    plane: &CrisisPlane,
    now: Timestamp,
) -> Option<String> {
    let protected_override = plane.has_active(now)
        || participants.iter().any(|o| o.active_override(now).is_some());
    let in_crisis = (plane.is_crisis_mode() && plane.has_active(now))
        || participants.iter().any(|o| o.in_crisis_with_override(now));

    if protected_override {
        if let Some(value) = fragment.get(FIELD_CRISIS_OVERRIDE) {
            let kept = match value.as_override().filter(|o| o.is_active(now)) {
                Some(kept) => kept,
                None => return Some(format!("{} would remove an active override", winner)),
            };
            // Every participant's active override must survive or be covered
            for held in participants.iter().filter_map(|o| o.active_override(now)) {
                if held.id != kept.id && !kept.flags.covers(&held.flags) {
                    return Some(format!("{} would narrow override {}", winner, held.id));
                }
            }
        }
        for field in [FIELD_THERAPEUTIC_ACCESS, FIELD_EMERGENCY_ACCESS] {
            if fragment.get(field) == Some(&FieldValue::Bool(false)) {
                return Some(format!("{} would revoke {}", winner, field));
            }
        }
    }
    if in_crisis && fragment.get(FIELD_CRISIS_MODE) == Some(&FieldValue::Bool(false)) {
        return Some(format!("{} would end crisis mode", winner));
    }
    None
}

/// Merge a winning fragment into `state`, keeping the plane's overrides
pub fn merge_resolution(
    state: &mut AccountState,
    resolution: &ConflictResolution,
    plane: &CrisisPlane,
    now: Timestamp,
) {
    for (field, value) in &resolution.winning_state {
        state.set(field, value.clone());
    }
    plane.mirror_into(state, now);
}

/// Observation registry and pending conflicts
#[derive(Debug, Default)]
pub struct ConflictResolver {
    observations: BTreeMap<DeviceId, DeviceObservation>,
    pending: BTreeMap<ConflictId, Conflict>,
    ids: IdSequence,
    resolved: u64,
    escalated: u64,
}

impl ConflictResolver {
    pub fn new() -> Self {
        ConflictResolver {
            ids: IdSequence::new(),
            ..Default::default()
        }
    }

    /// Record observations. Per device the highest `sync_counter` wins; an
    /// equal counter replaces the stored observation, a lower one is dropped.
    pub fn observe<I>(&mut self, observations: I)
    where
        I: IntoIterator<Item = DeviceObservation>,
    {
        for obs in observations {
            match self.observations.get(&obs.device_id) {
                Some(existing) if existing.sync_counter > obs.sync_counter => {}
                _ => {
                    self.observations.insert(obs.device_id.clone(), obs);
                }
            }
        }
    }

    pub fn observations(&self) -> impl Iterator<Item = &DeviceObservation> {
        self.observations.values()
    }

    /// Compare the recorded observations and refresh the pending set.
    /// Returns the conflicts detected by this pass.
    pub fn detect(&mut self, now: Timestamp) -> Vec<Conflict> {
        let observations: Vec<&DeviceObservation> = self.observations.values().collect();
        let mut by_family: BTreeMap<ConflictFamily, Vec<&'static str>> = BTreeMap::new();
        for (spec, family) in salient_fields() {
            by_family.entry(family).or_default().push(spec.name);
        }

        let mut detected = Vec::new();
        for (family, fields) in by_family {
            let mut divergent: Vec<String> = Vec::new();
            for (i, a) in observations.iter().enumerate() {
                for b in &observations[i + 1..] {
                    for field in &fields {
                        let x = a.state_fragment.get(*field);
                        let y = b.state_fragment.get(*field);
                        if let (Some(x), Some(y)) = (x, y) {
                            if x != y && !divergent.iter().any(|f| f == field) {
                                divergent.push(field.to_string());
                            }
                        }
                    }
                }
            }
            if divergent.is_empty() {
                continue;
            }

            let participants: Vec<DeviceObservation> = observations
                .iter()
                .filter(|o| fields.iter().any(|f| o.state_fragment.contains_key(*f)))
                .map(|o| (*o).clone())
                .collect();
            let conflict_type = ConflictType::from(family);
            let earlier = self
                .pending
                .values()
                .find(|c| c.conflict_type == conflict_type);

            // An escalation outlives re-detection
            let (id, resolution_strategy, escalated) = match earlier {
                Some(c) => (c.id, c.resolution_strategy, c.crisis_impact),
                None => (
                    ConflictId::new(self.ids.take()),
                    ResolutionStrategy::LastWriterWins,
                    false,
                ),
            };
            let crisis_impact =
                escalated || participants.iter().any(|o| o.carries_crisis_impact(now));

            let conflict = Conflict {
                id,
                detected_at: now,
                conflict_type,
                fields: divergent,
                device_observations: participants,
                resolution_strategy,
                crisis_impact,
                auto_resolvable: !crisis_impact && resolution_strategy != ResolutionStrategy::Manual,
            };
            tracing::info!(conflict = ?id, ?conflict_type, crisis_impact, "state conflict detected");
            self.pending.insert(id, conflict.clone());
            detected.push(conflict);
        }
        detected
    }

    pub fn pending(&self) -> impl Iterator<Item = &Conflict> {
        self.pending.values()
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.pending.get(&id)
    }

    /// Ids of pending conflicts safe to resolve without a person
    pub fn auto_resolvable(&self) -> Vec<ConflictId> {
        self.pending
            .values()
            .filter(|c| c.auto_resolvable)
            .map(|c| c.id)
            .collect()
    }

    /// Resolve a pending conflict. A winner that would revoke an active
    /// override escalates the conflict to manual and leaves it pending.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        plane: &CrisisPlane,
        now: Timestamp,
    ) -> ResilienceResult<ConflictResolution> {
        let started = Instant::now();
        let conflict = self
            .pending
            .get_mut(&id)
            .ok_or(ResilienceError::ConflictNotFound(id))?;

        let winner = match pick_winner(&conflict.device_observations, strategy) {
            Some(w) => w.clone(),
            None => {
                conflict.resolution_strategy = ResolutionStrategy::Manual;
                conflict.auto_resolvable = false;
                return Err(ResilienceError::ConflictUnresolved {
                    id,
                    reason: "manual resolution requested".to_string(),
                });
            }
        };

        let winning_state: BTreeMap<String, FieldValue> = winner
            .state_fragment
            .iter()
            .filter(|(field, _)| conflict.fields.iter().any(|f| f == *field))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let revoked = revocation(
            &winner.device_id,
            &winning_state,
            &conflict.device_observations,
            plane,
            now,
        );
        if let Some(reason) = revoked {
            if conflict.resolution_strategy != ResolutionStrategy::Manual {
                self.escalated += 1;
            }
            conflict.resolution_strategy = ResolutionStrategy::Manual;
            conflict.crisis_impact = true;
            conflict.auto_resolvable = false;
            tracing::warn!(conflict = ?id, %reason, "conflict escalated to manual");
            return Err(ResilienceError::ConflictUnresolved { id, reason });
        }

        let devices_updated: Vec<DeviceId> = conflict
            .device_observations
            .iter()
            .filter(|o| o.device_id != winner.device_id)
            .map(|o| o.device_id.clone())
            .collect();
        let observations_compared = conflict.device_observations.len();

        self.pending.remove(&id);
        self.resolved += 1;

        // Losers now hold the winning values
        for device in &devices_updated {
            if let Some(obs) = self.observations.get_mut(device) {
                for (field, value) in &winning_state {
                    obs.state_fragment.insert(field.clone(), value.clone());
                }
            }
        }

        tracing::info!(conflict = ?id, winner = %winner.device_id, "conflict resolved");
        Ok(ConflictResolution {
            conflict_id: id,
            resolved_at: now,
            strategy,
            winning_device: winner.device_id,
            winning_state,
            devices_updated,
            metrics: ResolutionMetrics {
                duration: started.elapsed(),
                observations_compared,
            },
        })
    }

    pub fn resolved_count(&self) -> u64 {
        self.resolved
    }

    pub fn escalated_count(&self) -> u64 {
        self.escalated
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.pending.clear();
    }
}
