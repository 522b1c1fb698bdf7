//! Crisis override tokens
//!
//! An override is a time-bounded grant of therapeutic and emergency access
//! that holds regardless of subscription status.

use serde::{Deserialize, Serialize};

use crate::{CheckpointId, OverrideId, Timestamp};

/// What an override unlocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverrideFlags {
    pub therapeutic_access: bool,
    pub emergency_access: bool,
    pub bypass_subscription: bool,
}

impl OverrideFlags {
    /// Every flag set
    pub const FULL: OverrideFlags = OverrideFlags {
        therapeutic_access: true,
        emergency_access: true,
        bypass_subscription: true,
    };

    /// Grants at least the therapeutic and emergency access `other` grants
    pub fn covers(&self, other: &OverrideFlags) -> bool {
        (self.therapeutic_access || !other.therapeutic_access)
            && (self.emergency_access || !other.emergency_access)
    }
}

impl Default for OverrideFlags {
    fn default() -> Self {
        OverrideFlags::FULL
    }
}

/// Crisis override
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisOverride {
    pub id: OverrideId,
    pub reason: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub flags: OverrideFlags,
    /// Checkpoint captured when the override was installed
    #[serde(default)]
    pub checkpoint_ref: Option<CheckpointId>,
}

impl CrisisOverride {
    pub fn new(
        id: OverrideId,
        reason: impl Into<String>,
        created_at: Timestamp,
        expires_at: Timestamp,
        flags: OverrideFlags,
    ) -> Self {
        CrisisOverride {
            id,
            reason: reason.into(),
            created_at,
            expires_at,
            flags,
            checkpoint_ref: None,
        }
    }

    /// Active means not yet expired
    #[inline]
    pub fn is_active(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }

    /// Whether the override grants emergency access at `now`
    #[inline]
    pub fn grants_emergency_access(&self, now: Timestamp) -> bool {
        self.is_active(now) && self.flags.emergency_access
    }
}
