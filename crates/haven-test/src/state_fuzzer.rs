//! Engine fuzzer - randomized operation sequences against the resilience engine
//!
//! Tests:
//! - Active overrides survive every operation, recoveries included
//! - Completed recoveries leave a valid state
//! - Revisions never go backwards
//! - The engine keeps working while storage misbehaves

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use haven_core::{
    AccountState, FieldValue, Revision, Tier, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE,
    FIELD_STATUS, FIELD_TIER, FIELD_USER_ID,
};
use haven_runtime::{EngineParts, OverrideRequest, ResilienceConfig, ResilienceEngine};
use haven_state::{
    CheckpointContext, FieldUpdate, OperationType, RecoveryStatus, RecoveryStrategy,
    SeverityLevel, UpdateType,
};
use haven_time::ManualClock;

use crate::chaos::{ChaosStore, StorageChaosConfig};

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of operations to run
    pub operation_count: usize,
    /// Probability that an operation corrupts the state and recovers
    pub corruption_prob: f64,
    /// Probability of a crisis-plane operation
    pub crisis_prob: f64,
    /// Probability of backup, restore or cleanup
    pub maintenance_prob: f64,
    /// Lifetime of every override, emergency ones included
    pub override_duration: Duration,
    /// Clock advance per operation
    pub step: Duration,
    /// Storage behaviour under the engine
    pub storage: StorageChaosConfig,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            operation_count: 500,
            corruption_prob: 0.15,
            crisis_prob: 0.1,
            maintenance_prob: 0.15,
            override_duration: Duration::from_secs(6 * 60 * 60),
            step: Duration::from_secs(60),
            storage: StorageChaosConfig::default(),
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            operation_count: 150,
            storage: StorageChaosConfig::calm(),
            ..Default::default()
        }
    }

    /// Heavy fuzzing on flaky storage
    pub fn heavy() -> Self {
        FuzzerConfig {
            operation_count: 1_000,
            corruption_prob: 0.25,
            crisis_prob: 0.15,
            override_duration: Duration::from_secs(60 * 60),
            step: Duration::from_secs(5 * 60),
            storage: StorageChaosConfig::flaky(),
            ..Default::default()
        }
    }

    /// Storage fails most of the time
    pub fn adversarial() -> Self {
        FuzzerConfig {
            operation_count: 400,
            corruption_prob: 0.3,
            storage: StorageChaosConfig::hostile(),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.storage.seed = seed;
        self
    }
}

/// How the fuzzer damages the state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
    DropTier,
    MistypeTier,
    UnknownStatus,
    DropUserId,
    CrisisWithoutOverride,
}

impl Corruption {
    const ALL: [Corruption; 5] = [
        Corruption::DropTier,
        Corruption::MistypeTier,
        Corruption::UnknownStatus,
        Corruption::DropUserId,
        Corruption::CrisisWithoutOverride,
    ];

    pub fn apply(self, state: &mut AccountState) {
        match self {
            Corruption::DropTier => {
                state.remove(FIELD_TIER);
            }
            Corruption::MistypeTier => {
                state.set(FIELD_TIER, FieldValue::Int(7));
            }
            Corruption::UnknownStatus => {
                state.set(FIELD_STATUS, FieldValue::text("bogus"));
            }
            Corruption::DropUserId => {
                state.remove(FIELD_USER_ID);
            }
            Corruption::CrisisWithoutOverride => {
                state.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
                state.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
            }
        }
    }
}

/// A fuzz operation
#[derive(Clone, Debug, PartialEq)]
pub enum FuzzOp {
    Update(Tier, bool),
    Checkpoint,
    Corrupt(Corruption, RecoveryStrategy),
    EnableCrisis,
    DisableCrisis,
    Continuity(SeverityLevel),
    Backup(bool),
    RestoreLatest,
    Cleanup,
}

/// Fuzzing result
#[derive(Clone, Debug, Default)]
pub struct FuzzResult {
    pub operations: usize,
    pub corruptions: usize,
    pub recoveries_completed: usize,
    pub emergency_fallbacks: usize,
    pub storage_failures: u64,
    pub violations: Vec<String>,
}

impl FuzzResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Resilience engine fuzzer
pub struct EngineFuzzer {
    config: FuzzerConfig,
    engine: ResilienceEngine,
    store: ChaosStore,
    clock: ManualClock,
    rng: StdRng,
    last_revision: Revision,
    checkpoints: u64,
}

impl EngineFuzzer {
    /// Create a new fuzzer
    pub fn new(config: FuzzerConfig) -> Self {
        let store = ChaosStore::new(config.storage.clone());
        let clock = ManualClock::default();
        let parts = EngineParts::in_memory()
            .with_store(Arc::new(store.clone()))
            .with_clock(Arc::new(clock.clone()));
        let engine_config = ResilienceConfig {
            checkpoint_retention: 4,
            max_backups: 3,
            emergency_override_secs: config.override_duration.as_secs(),
            ..Default::default()
        };
        let engine = ResilienceEngine::new(
            parts,
            engine_config,
            AccountState::for_user("fuzz-user", "basic"),
        );

        EngineFuzzer {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            engine,
            store,
            clock,
            last_revision: Revision::ZERO,
            checkpoints: 0,
        }
    }

    pub fn engine(&self) -> &ResilienceEngine {
        &self.engine
    }

    pub fn store(&self) -> &ChaosStore {
        &self.store
    }

    /// Generate a random operation
    fn generate_op(&mut self) -> FuzzOp {
        let roll: f64 = self.rng.gen();
        let corruption = self.config.corruption_prob;
        let crisis = corruption + self.config.crisis_prob;
        let maintenance = crisis + self.config.maintenance_prob;

        if roll < corruption {
            let kind = Corruption::ALL[self.rng.gen_range(0..Corruption::ALL.len())];
            let strategy = if self.rng.gen_bool(0.5) {
                RecoveryStrategy::CheckpointRollback
            } else {
                RecoveryStrategy::PartialFieldRepair
            };
            FuzzOp::Corrupt(kind, strategy)
        } else if roll < crisis {
            match self.rng.gen_range(0..4) {
                0 | 1 => FuzzOp::EnableCrisis,
                2 => FuzzOp::DisableCrisis,
                _ => {
                    let levels = [
                        SeverityLevel::Low,
                        SeverityLevel::Moderate,
                        SeverityLevel::High,
                        SeverityLevel::Critical,
                    ];
                    FuzzOp::Continuity(levels[self.rng.gen_range(0..levels.len())])
                }
            }
        } else if roll < maintenance {
            match self.rng.gen_range(0..3) {
                0 => FuzzOp::Backup(self.rng.gen_bool(0.5)),
                1 => FuzzOp::RestoreLatest,
                _ => FuzzOp::Cleanup,
            }
        } else if self.rng.gen_bool(0.3) {
            FuzzOp::Checkpoint
        } else {
            let tiers = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Family];
            let tier = tiers[self.rng.gen_range(0..tiers.len())];
            FuzzOp::Update(tier, self.rng.gen_bool(0.7))
        }
    }

    /// Run the fuzzer
    pub async fn run(&mut self) -> FuzzResult {
        let mut result = FuzzResult::default();

        // Rollback needs at least one clean snapshot
        if let Err(e) = self
            .engine
            .create_state_checkpoint(CheckpointContext::new(OperationType::Manual, "baseline"))
            .await
        {
            result.violations.push(format!("baseline checkpoint failed: {}", e));
        }

        for step in 0..self.config.operation_count {
            self.clock.advance(self.config.step);
            let op = self.generate_op();
            self.execute(step, &op, &mut result).await;
            self.check_invariants(step, &op, &mut result).await;
            result.operations += 1;
        }

        let diagnostics = self.engine.generate_resilience_diagnostics().await;
        result.storage_failures = diagnostics.health.storage_failures;
        tracing::debug!(
            operations = result.operations,
            corruptions = result.corruptions,
            violations = result.violations.len(),
            "fuzz run finished"
        );
        result
    }

    async fn execute(&mut self, step: usize, op: &FuzzOp, result: &mut FuzzResult) {
        match op {
            FuzzOp::Update(tier, persist) => {
                let updates = vec![FieldUpdate::new(FIELD_TIER, FieldValue::text(tier.as_str()))];
                if let Err(e) = self
                    .engine
                    .perform_incremental_update(UpdateType::Subscription, updates, *persist)
                    .await
                {
                    result.violations.push(format!("step {}: valid update refused: {}", step, e));
                }
            }
            FuzzOp::Checkpoint => {
                self.checkpoints += 1;
                let ctx = CheckpointContext::new(
                    OperationType::Scheduled,
                    format!("fuzz-{}", self.checkpoints),
                );
                if let Err(e) = self.engine.create_state_checkpoint(ctx).await {
                    result.violations.push(format!("step {}: checkpoint failed: {}", step, e));
                }
            }
            FuzzOp::Corrupt(kind, strategy) => {
                result.corruptions += 1;
                let mut state = self.engine.state().await;
                kind.apply(&mut state);
                self.engine.replace_state(state).await;
                self.recover(step, *kind, *strategy, result).await;
            }
            FuzzOp::EnableCrisis => {
                let request = OverrideRequest::new("fuzz crisis", self.config.override_duration);
                if let Err(e) = self.engine.enable_crisis_mode(request, true).await {
                    result.violations.push(format!("step {}: crisis refused: {}", step, e));
                }
            }
            FuzzOp::DisableCrisis => {
                // Refusal is a legitimate outcome when the state is unsafe
                let _ = self.engine.disable_crisis_mode(true).await;
            }
            FuzzOp::Continuity(level) => {
                let report = self.engine.ensure_therapeutic_continuity(*level).await;
                if !report.continuity_maintained {
                    result
                        .violations
                        .push(format!("step {}: continuity lost at {:?}", step, level));
                }
            }
            FuzzOp::Backup(encrypt) => {
                if let Err(e) = self.engine.create_state_backup(*encrypt).await {
                    result.violations.push(format!("step {}: backup failed: {}", step, e));
                }
            }
            FuzzOp::RestoreLatest => {
                let diagnostics = self.engine.generate_resilience_diagnostics().await;
                if let Some(id) = diagnostics.backups.last().copied() {
                    if let Err(e) = self.engine.restore_from_backup(id, true).await {
                        result.violations.push(format!("step {}: restore errored: {}", step, e));
                    }
                }
            }
            FuzzOp::Cleanup => {
                self.engine.cleanup_resilience_data().await;
            }
        }
    }

    async fn recover(
        &mut self,
        step: usize,
        kind: Corruption,
        strategy: RecoveryStrategy,
        result: &mut FuzzResult,
    ) {
        let Some(report) = self.engine.detect_state_corruption().await else {
            result
                .violations
                .push(format!("step {}: {:?} went undetected", step, kind));
            return;
        };

        let mut operation = self.engine.perform_state_recovery(&report, strategy).await;
        if operation.status != RecoveryStatus::Completed
            && strategy != RecoveryStrategy::CheckpointRollback
        {
            operation = self
                .engine
                .perform_state_recovery(&report, RecoveryStrategy::CheckpointRollback)
                .await;
        }

        if operation.emergency_fallback {
            result.emergency_fallbacks += 1;
        }
        if operation.status == RecoveryStatus::Completed {
            result.recoveries_completed += 1;
            if let Some(report) = self.engine.detect_state_corruption().await {
                result.violations.push(format!(
                    "step {}: completed recovery left {:?}",
                    step, report.affected_fields
                ));
            }
        }
    }

    /// Check the invariants after one operation
    async fn check_invariants(&mut self, step: usize, op: &FuzzOp, result: &mut FuzzResult) {
        let diagnostics = self.engine.generate_resilience_diagnostics().await;
        let state = self.engine.state().await;

        if !diagnostics.active_overrides.is_empty() {
            let held = state.crisis_override().map(|o| o.id);
            if !held.map_or(false, |id| diagnostics.active_overrides.contains(&id)) {
                result.violations.push(format!(
                    "step {}: active override missing from state after {:?}",
                    step, op
                ));
            }
        }

        if diagnostics.revision < self.last_revision {
            result.violations.push(format!(
                "step {}: revision went from {:?} to {:?}",
                step, self.last_revision, diagnostics.revision
            ));
        }
        self.last_revision = diagnostics.revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_light_fuzzing() {
        let mut fuzzer = EngineFuzzer::new(FuzzerConfig::light());
        let result = fuzzer.run().await;

        assert!(result.passed(), "violations: {:?}", result.violations);
        assert_eq!(result.operations, 150);
        assert!(result.corruptions > 0);
        assert_eq!(result.storage_failures, 0);
    }

    #[tokio::test]
    async fn test_fuzzing_on_flaky_storage() {
        let mut fuzzer = EngineFuzzer::new(FuzzerConfig {
            operation_count: 300,
            ..FuzzerConfig::heavy()
        });
        let result = fuzzer.run().await;

        assert!(result.passed(), "violations: {:?}", result.violations);
        assert!(result.recoveries_completed > 0);
        assert!(fuzzer.store().stats().writes_failed > 0);
    }

    #[tokio::test]
    async fn test_adversarial_storage_keeps_overrides() {
        for seed in [1, 2, 3] {
            let mut fuzzer = EngineFuzzer::new(FuzzerConfig::adversarial().with_seed(seed));
            let result = fuzzer.run().await;
            assert!(result.passed(), "seed {}: {:?}", seed, result.violations);
        }
    }

    #[tokio::test]
    async fn test_corruptions_are_detected() {
        for kind in Corruption::ALL {
            let mut state = AccountState::for_user("u", "basic");
            kind.apply(&mut state);
            let engine = ResilienceEngine::in_memory(state);
            assert!(
                engine.detect_state_corruption().await.is_some(),
                "{:?} not detected",
                kind
            );
        }
    }
}
