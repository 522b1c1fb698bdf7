//! End-to-end Integration Test Suite
//!
//! Scenarios that drive the complete engine through its public operations:
//! - Corruption, detection and rollback with and without a journal
//! - Cross-device conflicts, including ones that touch a crisis override
//! - Store resets with and without preserved overrides
//! - Operation on unavailable storage

use std::sync::Arc;
use std::time::Duration;

use haven_core::{
    AccountState, DeviceId, FieldValue, Tier, Timestamp, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE,
    FIELD_STATUS, FIELD_TIER,
};
use haven_runtime::{EngineParts, OverrideRequest, ResilienceConfig, ResilienceEngine};
use haven_state::{
    CheckpointContext, ConflictType, DeviceObservation, FieldUpdate, OperationType,
    RecoveryStatus, RecoveryStrategy, ResolutionStrategy, UpdateType,
};
use haven_store::{MemoryDeviceSync, OVERRIDE_PREFIX};
use haven_time::{Clock, ManualClock};

use crate::chaos::{ChaosStore, StorageChaosConfig};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// SCENARIO HARNESS
// ============================================================================

/// Engine wired to inspectable capabilities
pub struct ScenarioHarness {
    pub engine: ResilienceEngine,
    pub store: ChaosStore,
    pub devices: MemoryDeviceSync,
    pub clock: ManualClock,
}

impl ScenarioHarness {
    /// Basic-tier account on a healthy store
    pub fn new() -> Self {
        Self::with_config(ResilienceConfig::default(), StorageChaosConfig::calm())
    }

    pub fn with_config(config: ResilienceConfig, storage: StorageChaosConfig) -> Self {
        let store = ChaosStore::new(storage);
        let devices = MemoryDeviceSync::new();
        let clock = ManualClock::default();
        let parts = EngineParts::in_memory()
            .with_store(Arc::new(store.clone()))
            .with_devices(Arc::new(devices.clone()))
            .with_clock(Arc::new(clock.clone()));

        ScenarioHarness {
            engine: ResilienceEngine::new(parts, config, AccountState::for_user("user-1", "basic")),
            store,
            devices,
            clock,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub async fn set_tier(&self, tier: Tier, persist: bool) -> bool {
        let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::text(tier.as_str()))];
        self.engine
            .perform_incremental_update(UpdateType::Subscription, updates, persist)
            .await
            .is_ok()
    }

    /// Damage the live state directly
    pub async fn corrupt(&self, damage: impl FnOnce(&mut AccountState)) {
        let mut state = self.engine.state().await;
        damage(&mut state);
        self.engine.replace_state(state).await;
    }
}

impl Default for ScenarioHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Scenario outcome
#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub violations: Vec<String>,
}

impl ScenarioResult {
    fn new(name: &'static str) -> Self {
        ScenarioResult {
            name,
            violations: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, what: impl Into<String>) {
        if !ok {
            self.violations.push(what.into());
        }
    }

    /// Check if the scenario passed
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

async fn upgrade_then_lose_tier(name: &'static str, journaled: bool) -> ScenarioResult {
    let mut result = ScenarioResult::new(name);
    let h = ScenarioHarness::new();

    let checkpoint = match h
        .engine
        .create_state_checkpoint(CheckpointContext::new(OperationType::Manual, "before-upgrade"))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            result.check(false, format!("checkpoint failed: {}", e));
            return result;
        }
    };
    result.check(h.set_tier(Tier::Premium, journaled).await, "upgrade refused");
    h.corrupt(|state| {
        state.remove(FIELD_TIER);
    })
    .await;

    let Some(report) = h.engine.detect_state_corruption().await else {
        result.check(false, "missing tier went undetected");
        return result;
    };
    result.check(report.affects(FIELD_TIER), "report does not name the tier");
    result.check(!report.crisis_impact, "tier loss flagged as crisis impact");

    let operation = h
        .engine
        .perform_state_recovery(&report, RecoveryStrategy::CheckpointRollback)
        .await;
    result.check(
        operation.status == RecoveryStatus::Completed,
        format!("recovery ended {:?}", operation.status),
    );
    result.check(
        operation.checkpoints_used == vec![checkpoint],
        format!("restored from {:?}", operation.checkpoints_used),
    );

    let expected = if journaled { "premium" } else { "basic" };
    let state = h.engine.state().await;
    result.check(
        state.tier() == Some(expected),
        format!("tier is {:?}, expected {}", state.tier(), expected),
    );
    result.check(
        operation.data_loss != journaled,
        format!("data_loss = {} with journaled = {}", operation.data_loss, journaled),
    );
    result
}

/// Journaled upgrade is replayed on top of the older checkpoint
pub async fn scenario_journaled_upgrade_survives_corruption() -> ScenarioResult {
    upgrade_then_lose_tier("journaled_upgrade_survives_corruption", true).await
}

/// Unjournaled upgrade is rolled back and reported as lost
pub async fn scenario_unjournaled_upgrade_is_lost() -> ScenarioResult {
    upgrade_then_lose_tier("unjournaled_upgrade_is_lost", false).await
}

/// Two devices disagree on the tier; the newer sync wins and the older
/// device is brought up to date
pub async fn scenario_device_conflict() -> ScenarioResult {
    let mut result = ScenarioResult::new("device_conflict");
    let h = ScenarioHarness::new();
    let now = h.now();

    let earlier = now.saturating_sub(Duration::from_secs(120));
    let stale = DeviceObservation::new("device1", earlier, 4, 0.9)
        .with_field(FIELD_TIER, FieldValue::text("basic"));
    let fresh = DeviceObservation::new("device2", now, 7, 0.9)
        .with_field(FIELD_TIER, FieldValue::text("premium"));

    let conflicts = h.engine.detect_state_conflicts(vec![stale, fresh]).await;
    result.check(conflicts.len() == 1, format!("{} conflicts detected", conflicts.len()));
    let Some(conflict) = conflicts.first() else {
        return result;
    };
    result.check(
        conflict.conflict_type == ConflictType::SubscriptionMismatch,
        format!("conflict type {:?}", conflict.conflict_type),
    );
    result.check(conflict.auto_resolvable, "tier conflict not auto-resolvable");

    let resolution = match h
        .engine
        .resolve_state_conflict(conflict.id, ResolutionStrategy::LastWriterWins)
        .await
    {
        Ok(resolution) => resolution,
        Err(e) => {
            result.check(false, format!("resolution failed: {}", e));
            return result;
        }
    };
    let device1 = DeviceId::new("device1");
    result.check(
        resolution.winning_state.get(FIELD_TIER) == Some(&FieldValue::text("premium")),
        "winning tier is not premium",
    );
    result.check(
        resolution.winning_device == DeviceId::new("device2"),
        format!("winner {}", resolution.winning_device),
    );
    result.check(
        resolution.devices_updated.contains(&device1),
        "device1 not updated",
    );
    result.check(
        h.engine.state().await.tier() == Some("premium"),
        "resolution not merged into the state",
    );

    let sync = h
        .engine
        .synchronize_subscription_tier(Tier::Premium, &resolution.devices_updated, true)
        .await;
    result.check(sync.errors.is_empty(), format!("sync errors {:?}", sync.errors));
    result.check(
        h.devices.last_update(&device1).map(|u| u.tier) == Some(Tier::Premium),
        "device1 never received the tier",
    );

    let diagnostics = h.engine.generate_resilience_diagnostics().await;
    result.check(diagnostics.pending_conflicts.is_empty(), "conflict still pending");
    result.check(diagnostics.conflicts_resolved == 1, "resolution not counted");
    result
}

/// A newer device that dropped the override cannot take it away
pub async fn scenario_override_survives_conflicts() -> ScenarioResult {
    let mut result = ScenarioResult::new("override_survives_conflicts");
    let h = ScenarioHarness::new();

    let o = match h
        .engine
        .enable_crisis_mode(OverrideRequest::new("panic attack", DAY), true)
        .await
    {
        Ok(o) => o,
        Err(e) => {
            result.check(false, format!("crisis mode refused: {}", e));
            return result;
        }
    };
    let now = h.now();

    let earlier = now.saturating_sub(Duration::from_secs(10));
    let phone = DeviceObservation::new("phone", earlier, 3, 0.8)
        .with_field(FIELD_CRISIS_MODE, FieldValue::Bool(true))
        .with_field(FIELD_CRISIS_OVERRIDE, FieldValue::from(o.clone()));
    let tablet = DeviceObservation::new("tablet", now, 9, 1.0)
        .with_field(FIELD_CRISIS_MODE, FieldValue::Bool(false))
        .with_field(FIELD_CRISIS_OVERRIDE, FieldValue::Null);

    let conflicts = h.engine.detect_state_conflicts(vec![phone, tablet]).await;
    let Some(conflict) = conflicts
        .iter()
        .find(|c| c.conflict_type == ConflictType::CrisisStateMismatch)
    else {
        result.check(false, "crisis divergence went undetected");
        return result;
    };
    result.check(conflict.crisis_impact, "crisis conflict without crisis impact");
    result.check(!conflict.auto_resolvable, "crisis conflict auto-resolvable");

    for strategy in [ResolutionStrategy::LastWriterWins, ResolutionStrategy::HighestConfidence] {
        let refused = h.engine.resolve_state_conflict(conflict.id, strategy).await;
        result.check(
            refused.is_err(),
            format!("{:?} revoked the override", strategy),
        );
    }

    let state = h.engine.state().await;
    result.check(state.crisis_mode(), "crisis mode lost");
    result.check(
        state.crisis_override().map(|held| held.id) == Some(o.id),
        "override lost",
    );

    let diagnostics = h.engine.generate_resilience_diagnostics().await;
    result.check(
        diagnostics
            .pending_conflicts
            .iter()
            .any(|c| c.id == conflict.id && !c.auto_resolvable),
        "escalated conflict not pending",
    );
    result.check(diagnostics.conflicts_escalated >= 1, "escalation not counted");
    result
}

/// Reset drops all resilience data; overrides survive only when asked
pub async fn scenario_reset(preserve_crisis_overrides: bool) -> ScenarioResult {
    let mut result = ScenarioResult::new(if preserve_crisis_overrides {
        "reset_preserving_overrides"
    } else {
        "reset_dropping_overrides"
    });
    let h = ScenarioHarness::new();

    let o = match h
        .engine
        .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
        .await
    {
        Ok(o) => o,
        Err(e) => {
            result.check(false, format!("crisis mode refused: {}", e));
            return result;
        }
    };
    result.check(h.set_tier(Tier::Premium, true).await, "update refused");
    result.check(
        h.engine.create_state_backup(true).await.is_ok(),
        "backup failed",
    );

    h.engine.reset_resilience_store(preserve_crisis_overrides).await;
    h.engine.flush_writes().await;

    let diagnostics = h.engine.generate_resilience_diagnostics().await;
    result.check(diagnostics.checkpoints == 0, "checkpoints survived reset");
    result.check(diagnostics.journal_entries == 0, "journal survived reset");
    result.check(diagnostics.backups.is_empty(), "backups survived reset");

    let state = h.engine.state().await;
    let stored = h.store.inner();
    if preserve_crisis_overrides {
        result.check(diagnostics.active_overrides == vec![o.id], "override dropped");
        result.check(
            state.crisis_override().map(|held| held.id) == Some(o.id),
            "override missing from the state",
        );
        result.check(
            stored.len() == 1 && stored.keys_with_prefix(OVERRIDE_PREFIX).len() == 1,
            format!("{} stored records, expected only the override", stored.len()),
        );
    } else {
        result.check(diagnostics.active_overrides.is_empty(), "override kept");
        result.check(state.crisis_override().is_none(), "override left in the state");
        result.check(!state.crisis_mode(), "crisis mode left on");
        result.check(stored.is_empty(), format!("{} stored records left", stored.len()));
    }
    result
}

/// With the store down every operation still takes effect in memory, and
/// the engine recovers once writes succeed again
pub async fn scenario_degraded_storage() -> ScenarioResult {
    let mut result = ScenarioResult::new("degraded_storage");
    let h = ScenarioHarness::new();
    h.store.set_offline(true);

    let o = match h
        .engine
        .enable_crisis_mode(OverrideRequest::new("panic", DAY), true)
        .await
    {
        Ok(o) => o,
        Err(e) => {
            result.check(false, format!("crisis mode refused offline: {}", e));
            return result;
        }
    };
    let state = h.engine.state().await;
    result.check(
        state.crisis_override().map(|held| held.id) == Some(o.id),
        "override not applied before the store answered",
    );
    h.engine.flush_writes().await;
    result.check(h.engine.is_degraded().await, "outage not reflected");
    result.check(h.set_tier(Tier::Premium, true).await, "update refused offline");
    result.check(
        h.engine
            .create_state_checkpoint(CheckpointContext::new(OperationType::Manual, "offline"))
            .await
            .is_ok(),
        "checkpoint refused offline",
    );
    h.engine.flush_writes().await;

    let diagnostics = h.engine.generate_resilience_diagnostics().await;
    result.check(
        diagnostics.journal_write_failures >= 1,
        "journal write failure not recorded",
    );
    result.check(diagnostics.health.storage_failures >= 3, "storage failures not counted");

    h.corrupt(|state| {
        state.set(FIELD_STATUS, FieldValue::text("bogus"));
    })
    .await;
    if let Some(report) = h.engine.detect_state_corruption().await {
        let operation = h
            .engine
            .perform_state_recovery(&report, RecoveryStrategy::CheckpointRollback)
            .await;
        result.check(
            operation.status == RecoveryStatus::Completed,
            "offline recovery failed",
        );
    } else {
        result.check(false, "corruption went undetected offline");
    }
    let state = h.engine.state().await;
    result.check(state.tier() == Some("premium"), "upgrade lost offline");
    result.check(
        state.crisis_override().map(|held| held.id) == Some(o.id),
        "override lost offline",
    );

    h.engine.flush_writes().await;
    h.store.set_offline(false);
    result.check(
        h.engine
            .create_state_checkpoint(CheckpointContext::new(OperationType::Manual, "online"))
            .await
            .is_ok(),
        "checkpoint refused online",
    );
    h.engine.flush_writes().await;
    result.check(!h.engine.is_degraded().await, "still degraded after a good write");
    result.check(!h.store.inner().is_empty(), "nothing written once online");
    result
}

/// Run every scenario
pub async fn run_all() -> Vec<ScenarioResult> {
    vec![
        scenario_journaled_upgrade_survives_corruption().await,
        scenario_unjournaled_upgrade_is_lost().await,
        scenario_device_conflict().await,
        scenario_override_survives_conflicts().await,
        scenario_reset(true).await,
        scenario_reset(false).await,
        scenario_degraded_storage().await,
    ]
}
