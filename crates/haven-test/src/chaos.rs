//! Chaos testing for the backing store
//!
//! Wraps an in-memory store and injects the failures a device sees in the
//! field:
//! - Failed writes
//! - Failed reads
//! - Garbled reads
//! - Whole-store outages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use haven_store::{BackingStore, MemoryStore, StoreError, StoreResult};

/// Storage chaos configuration
#[derive(Clone, Debug)]
pub struct StorageChaosConfig {
    /// Write failure rate (0.0 - 1.0)
    pub write_failure_rate: f64,
    /// Read failure rate (0.0 - 1.0)
    pub read_failure_rate: f64,
    /// Rate at which a successful read returns a damaged value
    pub garble_rate: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for StorageChaosConfig {
    fn default() -> Self {
        StorageChaosConfig {
            write_failure_rate: 0.05,
            read_failure_rate: 0.02,
            garble_rate: 0.0,
            seed: 42,
        }
    }
}

impl StorageChaosConfig {
    /// No injected failures
    pub fn calm() -> Self {
        StorageChaosConfig {
            write_failure_rate: 0.0,
            read_failure_rate: 0.0,
            garble_rate: 0.0,
            seed: 42,
        }
    }

    /// Occasional failures
    pub fn flaky() -> Self {
        StorageChaosConfig {
            write_failure_rate: 0.2,
            read_failure_rate: 0.1,
            garble_rate: 0.05,
            seed: 42,
        }
    }

    /// Most operations fail
    pub fn hostile() -> Self {
        StorageChaosConfig {
            write_failure_rate: 0.6,
            read_failure_rate: 0.4,
            garble_rate: 0.2,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Injected fault counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub writes: u64,
    pub writes_failed: u64,
    pub reads: u64,
    pub reads_failed: u64,
    pub reads_garbled: u64,
    pub removes_failed: u64,
}

/// Backing store with injected faults. Clones share items, rng and stats.
#[derive(Clone, Debug)]
pub struct ChaosStore {
    inner: MemoryStore,
    config: StorageChaosConfig,
    rng: Arc<Mutex<StdRng>>,
    offline: Arc<AtomicBool>,
    stats: Arc<Mutex<ChaosStats>>,
}

impl ChaosStore {
    pub fn new(config: StorageChaosConfig) -> Self {
        ChaosStore {
            inner: MemoryStore::new(),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(config.seed))),
            config,
            offline: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(ChaosStats::default())),
        }
    }

    /// The healthy store underneath, for inspection
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail every operation until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChaosStats {
        self.stats.lock().clone()
    }

    fn roll(&self, rate: f64) -> bool {
        rate > 0.0 && self.rng.lock().gen::<f64>() < rate
    }

    fn outage(&self) -> StoreResult<()> {
        if self.is_offline() {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Damage a stored value so that it no longer decodes
fn garble(value: &str) -> String {
    let mut damaged: String = value.chars().rev().collect();
    damaged.push('#');
    damaged
}

#[async_trait]
impl BackingStore for ChaosStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        self.stats.lock().reads += 1;
        if let Err(e) = self.outage() {
            self.stats.lock().reads_failed += 1;
            return Err(e);
        }
        if self.roll(self.config.read_failure_rate) {
            self.stats.lock().reads_failed += 1;
            tracing::debug!(%key, "injected read failure");
            return Err(StoreError::Backend(format!("injected read failure at {}", key)));
        }

        let value = self.inner.get_item(key).await?;
        match value {
            Some(text) if self.roll(self.config.garble_rate) => {
                self.stats.lock().reads_garbled += 1;
                tracing::debug!(%key, "injected garbled read");
                Ok(Some(garble(&text)))
            }
            other => Ok(other),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        self.stats.lock().writes += 1;
        if let Err(e) = self.outage() {
            self.stats.lock().writes_failed += 1;
            return Err(e);
        }
        if self.roll(self.config.write_failure_rate) {
            self.stats.lock().writes_failed += 1;
            tracing::debug!(%key, "injected write failure");
            return Err(StoreError::Backend(format!("injected write failure at {}", key)));
        }
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> StoreResult<()> {
        if let Err(e) = self.outage() {
            self.stats.lock().removes_failed += 1;
            return Err(e);
        }
        self.inner.remove_item(key).await
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.stats.lock().reads += 1;
        if let Err(e) = self.outage() {
            self.stats.lock().reads_failed += 1;
            return Err(e);
        }
        self.inner.list_keys(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calm_store_passes_through() {
        let store = ChaosStore::new(StorageChaosConfig::calm());
        for i in 0..50 {
            store.set_item(&format!("k{}", i), "v".into()).await.unwrap();
        }
        for i in 0..50 {
            let value = store.get_item(&format!("k{}", i)).await.unwrap();
            assert_eq!(value.as_deref(), Some("v"));
        }

        let stats = store.stats();
        assert_eq!(stats.writes, 50);
        assert_eq!(stats.writes_failed, 0);
        assert_eq!(stats.reads_failed + stats.reads_garbled, 0);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let store = ChaosStore::new(StorageChaosConfig::calm());
        store.set_item("k", "v".into()).await.unwrap();
        store.set_offline(true);

        assert!(matches!(store.get_item("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.set_item("k", "w".into()).await.is_err());
        assert!(store.remove_item("k").await.is_err());
        assert_eq!(store.inner().raw_get("k").as_deref(), Some("v"));

        store.set_offline(false);
        assert_eq!(store.get_item("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_hostile_store_injects_failures() {
        let store = ChaosStore::new(StorageChaosConfig::hostile());
        for i in 0..200 {
            let _ = store.set_item(&format!("k{}", i), "value".into()).await;
        }
        let stats = store.stats();
        assert!(stats.writes_failed > 50);
        assert!(stats.writes_failed < 200);
        assert_eq!(
            store.inner().len() as u64,
            stats.writes - stats.writes_failed
        );
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        let pattern = |store: ChaosStore| async move {
            let mut failed = Vec::new();
            for i in 0..100 {
                failed.push(store.set_item(&format!("k{}", i), "v".into()).await.is_err());
            }
            failed
        };

        let a = pattern(ChaosStore::new(StorageChaosConfig::flaky().with_seed(7))).await;
        let b = pattern(ChaosStore::new(StorageChaosConfig::flaky().with_seed(7))).await;
        assert_eq!(a, b);
        assert!(a.iter().any(|f| *f));
    }

    #[test]
    fn test_garbled_value_differs() {
        assert_ne!(garble("abc"), "abc");
        assert!(garble("abc").ends_with('#'));
    }
}
