//! Health counters and the diagnostics snapshot

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use haven_core::{BackupId, CheckpointId, ConflictId, OverrideId, Revision, Timestamp};
use haven_state::{CorruptionReport, RecoveryOperation};
use haven_time::LatencyBook;

/// Counters the engine keeps while running
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounters {
    pub storage_failures: u64,
    /// Set by the first absorbed storage failure, cleared by the next
    /// successful write
    pub degraded: bool,
    pub corruption_reports: u64,
    pub recoveries: u64,
    pub validation_ticks: u64,
    pub crisis_checks: u64,
    /// Ticks skipped because a crisis operation was in flight
    pub ticks_skipped: u64,
    pub conflicts_auto_resolved: u64,
    pub last_validation_at: Option<Timestamp>,
}

impl HealthCounters {
    pub fn storage_failed(&mut self) {
        self.storage_failures += 1;
        self.degraded = true;
    }

    pub fn storage_ok(&mut self) {
        self.degraded = false;
    }
}

/// Latency figures for one operation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub violations: u64,
    pub max_ms: u64,
    pub mean_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub id: ConflictId,
    pub fields: Vec<String>,
    pub crisis_impact: bool,
    pub auto_resolvable: bool,
}

/// Point-in-time view of the engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceDiagnostics {
    pub generated_at: Timestamp,
    pub revision: Revision,
    pub state_valid: bool,
    pub crisis_mode: bool,
    pub active_overrides: Vec<OverrideId>,
    pub checkpoints: usize,
    pub resident_checkpoint_bytes: usize,
    pub last_known_good: Option<CheckpointId>,
    pub journal_entries: usize,
    pub journal_write_failures: u32,
    /// Durable writes queued but not yet applied
    pub pending_writes: usize,
    pub backups: Vec<BackupId>,
    pub pending_conflicts: Vec<PendingConflict>,
    pub conflicts_resolved: u64,
    pub conflicts_escalated: u64,
    pub last_report: Option<CorruptionReport>,
    pub recent_recoveries: Vec<RecoveryOperation>,
    pub latency: BTreeMap<String, LatencySummary>,
    pub health: HealthCounters,
}

impl ResilienceDiagnostics {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn latency_violations(&self) -> u64 {
        self.latency.values().map(|l| l.violations).sum()
    }
}

pub(crate) fn summarize_latency(book: &LatencyBook) -> BTreeMap<String, LatencySummary> {
    book.iter()
        .map(|(operation, stats)| {
            (
                operation.to_string(),
                LatencySummary {
                    samples: stats.samples,
                    violations: stats.violations,
                    max_ms: stats.max.as_millis() as u64,
                    mean_ms: stats.mean().as_millis() as u64,
                },
            )
        })
        .collect()
}
