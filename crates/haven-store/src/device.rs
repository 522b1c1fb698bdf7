//! Device sync capability
//!
//! Propagates the canonical subscription tier to the other devices of the
//! account. Delivery is per device; one failure never blocks the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use haven_core::{CrisisOverride, DeviceId, Tier, Timestamp};

use crate::{StoreError, StoreResult};

/// Tier update pushed to a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierUpdate {
    pub tier: Tier,
    /// Carried when the push is crisis-safe and an override is active
    pub crisis_override: Option<CrisisOverride>,
    pub issued_at: Timestamp,
}

/// Per-device propagation
#[async_trait]
pub trait DeviceSync: Send + Sync {
    async fn push_tier(&self, device: &DeviceId, update: &TierUpdate) -> StoreResult<()>;
}

/// In-process device registry: records the last update per device
#[derive(Clone, Debug, Default)]
pub struct MemoryDeviceSync {
    delivered: Arc<Mutex<BTreeMap<DeviceId, TierUpdate>>>,
    unreachable: Arc<Mutex<BTreeSet<DeviceId>>>,
}

impl MemoryDeviceSync {
    pub fn new() -> Self {
        MemoryDeviceSync::default()
    }

    /// Make pushes to `device` fail until cleared
    pub fn set_unreachable(&self, device: &DeviceId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(device.clone());
        } else {
            set.remove(device);
        }
    }

    pub fn last_update(&self, device: &DeviceId) -> Option<TierUpdate> {
        self.delivered.lock().get(device).cloned()
    }
}

#[async_trait]
impl DeviceSync for MemoryDeviceSync {
    async fn push_tier(&self, device: &DeviceId, update: &TierUpdate) -> StoreResult<()> {
        if self.unreachable.lock().contains(device) {
            tracing::debug!(%device, tier = update.tier.as_str(), "push to unreachable device");
            return Err(StoreError::Unavailable(format!("device {} unreachable", device)));
        }
        self.delivered.lock().insert(device.clone(), update.clone());
        Ok(())
    }
}
