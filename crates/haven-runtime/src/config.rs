//! Engine configuration
//!
//! Every section has defaults, so a partial JSON document is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use haven_core::{ResilienceError, ResilienceResult};
use haven_state::PerformanceConfig;

/// Resilience engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Most recent checkpoints kept by cleanup
    pub checkpoint_retention: usize,
    /// Backup retention horizon
    pub max_backups: usize,
    /// Lifetime of an emergency override installed by recovery or continuity
    pub emergency_override_secs: u64,
    /// Recovery attempts kept for diagnostics
    pub recovery_history: usize,
    /// Upper bound on a single backing-store call
    pub store_timeout_ms: u64,
    pub latency: LatencyTargets,
    pub performance: PerformanceConfig,
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            checkpoint_retention: 10,
            max_backups: 20,
            emergency_override_secs: 24 * 60 * 60,
            recovery_history: 32,
            store_timeout_ms: 2_000,
            latency: LatencyTargets::default(),
            performance: PerformanceConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn from_json(json: &str) -> ResilienceResult<Self> {
        serde_json::from_str(json).map_err(|e| ResilienceError::Serialization(e.to_string()))
    }

    pub fn emergency_duration(&self) -> Duration {
        Duration::from_secs(self.emergency_override_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }
}

/// Per-operation latency targets in milliseconds. Diagnostic only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyTargets {
    pub checkpoint_ms: u64,
    pub detection_ms: u64,
    pub recovery_ms: u64,
    pub conflict_ms: u64,
    pub update_ms: u64,
    pub backup_ms: u64,
    pub crisis_ms: u64,
}

impl Default for LatencyTargets {
    fn default() -> Self {
        LatencyTargets {
            checkpoint_ms: 50,
            detection_ms: 25,
            recovery_ms: 500,
            conflict_ms: 100,
            update_ms: 50,
            backup_ms: 200,
            crisis_ms: 200,
        }
    }
}

impl LatencyTargets {
    pub fn checkpoint(&self) -> Duration {
        Duration::from_millis(self.checkpoint_ms)
    }

    pub fn detection(&self) -> Duration {
        Duration::from_millis(self.detection_ms)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }

    pub fn conflict(&self) -> Duration {
        Duration::from_millis(self.conflict_ms)
    }

    pub fn update(&self) -> Duration {
        Duration::from_millis(self.update_ms)
    }

    pub fn backup(&self) -> Duration {
        Duration::from_millis(self.backup_ms)
    }

    pub fn crisis(&self) -> Duration {
        Duration::from_millis(self.crisis_ms)
    }
}

/// Background validation schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Tick period
    pub interval_ms: u64,
    /// Check crisis fields on every tick while an override is active
    pub crisis_validation_priority: bool,
    /// Run the full corruption scan every N ticks
    pub full_validation_every: u64,
    /// Scan observed devices for conflicts on full-validation ticks
    pub conflict_scan: bool,
    /// Resolve auto-resolvable conflicts found by the scan
    pub auto_resolve_conflicts: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            interval_ms: 5_000,
            crisis_validation_priority: true,
            full_validation_every: 6,
            conflict_scan: true,
            auto_resolve_conflicts: true,
        }
    }
}

impl ValidationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Structured logging setup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}
