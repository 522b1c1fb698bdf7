//! History compression and checkpoint memory eviction

use std::collections::BTreeSet;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use haven_core::{
    AccountState, CheckpointId, HistoryArchive, PaymentRecord, ResilienceError, ResilienceResult,
    Timestamp,
};

use crate::CheckpointManager;

/// Performance tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Evict persisted checkpoint payloads and reload them on demand
    pub lazy_loading: bool,
    /// History smaller than this is left alone
    pub compression_threshold_bytes: usize,
    /// Recent payment records kept uncompressed
    pub history_retain_recent: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            lazy_loading: true,
            compression_threshold_bytes: 4 * 1024,
            history_retain_recent: 12,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionResult {
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
    pub items_compressed: usize,
}

impl CompressionResult {
    fn unchanged(size: usize) -> Self {
        CompressionResult {
            original_size: size,
            compressed_size: size,
            ratio: 1.0,
            items_compressed: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryOptimization {
    pub memory_freed: usize,
    /// Fraction of resident checkpoint bytes released
    pub performance_improvement: f64,
    /// Payload dropped, checkpoint still indexed
    pub evicted: Vec<CheckpointId>,
    /// Dropped entirely
    pub removed: Vec<CheckpointId>,
}

/// Fold payment records older than the newest `retain_recent` into a
/// compressed archive block. Subscription fields and overrides are never
/// touched.
pub fn compress_payment_history(
    state: &mut AccountState,
    retain_recent: usize,
    threshold_bytes: usize,
) -> ResilienceResult<CompressionResult> {
    let total = state.history_size();
    if total < threshold_bytes || state.payment_history.len() <= retain_recent {
        return Ok(CompressionResult::unchanged(total));
    }

    state.payment_history.sort_by_key(|r| r.paid_at);
    let split = state.payment_history.len() - retain_recent;
    let old: Vec<PaymentRecord> = state.payment_history.drain(..split).collect();

    let json = serde_json::to_vec(&old).map_err(|e| ResilienceError::Serialization(e.to_string()))?;
    let original_size = json.len();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| ResilienceError::Serialization(e.to_string()))?;
    let data = encoder
        .finish()
        .map_err(|e| ResilienceError::Serialization(e.to_string()))?;

    let archive = HistoryArchive {
        records: old.len(),
        original_size,
        newest_paid_at: old.last().map_or(Timestamp::ZERO, |r| r.paid_at),
        data,
    };
    let compressed_size = archive.data.len();
    tracing::debug!(
        records = archive.records,
        original_size,
        compressed_size,
        "payment history archived"
    );
    state.archived_history.push(archive);

    Ok(CompressionResult {
        original_size,
        compressed_size,
        ratio: compressed_size as f64 / original_size.max(1) as f64,
        items_compressed: old.len(),
    })
}

/// Read an archive block back
pub fn decompress_archive(archive: &HistoryArchive) -> ResilienceResult<Vec<PaymentRecord>> {
    let mut json = Vec::with_capacity(archive.original_size);
    GzDecoder::new(archive.data.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| ResilienceError::Serialization(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| ResilienceError::Serialization(e.to_string()))
}

/// Release checkpoints beyond `retention`, sparing the last-known-good one
/// and anything in `protected`. With `lazy_loading` only persisted payloads
/// are dropped and the checkpoints stay indexed.
pub fn optimize_memory(
    checkpoints: &mut CheckpointManager,
    retention: usize,
    protected: &BTreeSet<CheckpointId>,
    lazy_loading: bool,
) -> MemoryOptimization {
    let before = checkpoints.resident_bytes();
    let mut result = MemoryOptimization::default();

    for id in checkpoints.eviction_candidates(retention, protected) {
        if lazy_loading {
            if let Some(freed) = checkpoints.evict_payload(id) {
                result.memory_freed += freed;
                result.evicted.push(id);
            }
        } else if let Some(removed) = checkpoints.remove(id) {
            result.memory_freed += removed.payload().map_or(0, |p| p.size());
            result.removed.push(id);
        }
    }

    if before > 0 {
        result.performance_improvement = result.memory_freed as f64 / before as f64;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CheckpointContext, OperationType};
    use haven_core::{FieldValue, Revision, FIELD_TIER};
    use haven_crypto::ChaChaAdapter;

    fn with_history(n: usize) -> AccountState {
        let mut state = AccountState::for_user("u-1", "premium");
        for i in 0..n {
            state.payment_history.push(PaymentRecord {
                id: format!("pay-{}", i),
                amount_cents: 999,
                currency: "USD".into(),
                paid_at: Timestamp::from_secs(i as i64 * 86_400),
                description: "monthly premium subscription".into(),
            });
        }
        state
    }

    #[test]
    fn test_below_threshold_untouched() {
        let mut state = with_history(3);
        let result = compress_payment_history(&mut state, 1, 1 << 20).unwrap();
        assert_eq!(result.items_compressed, 0);
        assert_eq!(result.ratio, 1.0);
        assert_eq!(state.payment_history.len(), 3);
    }

    #[test]
    fn test_compresses_older_records() {
        let mut state = with_history(200);
        let before = state.clone();
        let result = compress_payment_history(&mut state, 12, 1024).unwrap();

        assert_eq!(result.items_compressed, 188);
        assert!(result.compressed_size < result.original_size);
        assert!(result.ratio < 1.0);
        assert_eq!(state.payment_history.len(), 12);
        assert_eq!(state.payment_history[0].id, "pay-188");
        assert_eq!(state.get(FIELD_TIER), before.get(FIELD_TIER));

        let restored = decompress_archive(&state.archived_history[0]).unwrap();
        assert_eq!(restored.len(), 188);
        assert_eq!(restored[..], before.payment_history[..188]);
    }

    #[test]
    fn test_lazy_eviction_keeps_index() {
        let adapter = ChaChaAdapter::generate();
        let mut checkpoints = CheckpointManager::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let mut state = AccountState::for_user("u-1", "basic");
            state.set("n", FieldValue::Int(i));
            let created = checkpoints
                .create(
                    &adapter,
                    &state,
                    &CheckpointContext::new(OperationType::Scheduled, format!("s{}", i)),
                    Timestamp::ZERO,
                    Revision(i as u64),
                )
                .unwrap();
            checkpoints.mark_persisted(created.id);
            ids.push(created.id);
        }

        let result = optimize_memory(&mut checkpoints, 1, &BTreeSet::new(), true);
        // newest and last-known-good are the same checkpoint
        assert_eq!(result.evicted, vec![ids[2], ids[1], ids[0]]);
        assert!(result.memory_freed > 0);
        assert!(result.performance_improvement > 0.5);
        assert_eq!(checkpoints.len(), 4);
        assert!(checkpoints.get(ids[3]).unwrap().is_resident());
    }

    #[test]
    fn test_eager_eviction_removes() {
        let adapter = ChaChaAdapter::generate();
        let mut checkpoints = CheckpointManager::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut state = AccountState::for_user("u-1", "basic");
            state.set("n", FieldValue::Int(i));
            ids.push(
                checkpoints
                    .create(
                        &adapter,
                        &state,
                        &CheckpointContext::new(OperationType::Scheduled, format!("s{}", i)),
                        Timestamp::ZERO,
                        Revision(i as u64),
                    )
                    .unwrap()
                    .id,
            );
        }

        let protected: BTreeSet<_> = [ids[0]].into_iter().collect();
        let result = optimize_memory(&mut checkpoints, 1, &protected, false);
        assert_eq!(result.removed, vec![ids[1]]);
        assert_eq!(checkpoints.len(), 2);
    }
}
