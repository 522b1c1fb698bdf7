//! Account-state field schema
//!
//! The schema is the single place that says which fields are critical, which
//! are compared across devices, and which are crisis-sensitive. Detector,
//! journal validation and conflict logic all read it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::FieldKind;

pub const FIELD_USER_ID: &str = "user_id";
pub const FIELD_TIER: &str = "tier";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_CRISIS_MODE: &str = "crisis_mode";
pub const FIELD_CRISIS_OVERRIDE: &str = "crisis_override";
pub const FIELD_THERAPEUTIC_ACCESS: &str = "therapeutic_access";
pub const FIELD_EMERGENCY_ACCESS: &str = "emergency_access";
pub const FIELD_TRIAL_ENDS_AT: &str = "trial_ends_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// Field family used to classify cross-device divergence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictFamily {
    Subscription,
    Status,
    Crisis,
}

/// Schema entry for one field
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Missing or mistyped critical fields make the state unusable
    pub critical: bool,
    /// `Null` is an acceptable value
    pub nullable: bool,
    /// Compared across devices when set
    pub salient: Option<ConflictFamily>,
    /// Mutations must respect active crisis overrides
    pub crisis_sensitive: bool,
}

pub const FIELD_SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        name: FIELD_USER_ID,
        kind: FieldKind::Text,
        critical: true,
        nullable: false,
        salient: None,
        crisis_sensitive: false,
    },
    FieldSpec {
        name: FIELD_TIER,
        kind: FieldKind::Text,
        critical: true,
        nullable: false,
        salient: Some(ConflictFamily::Subscription),
        crisis_sensitive: false,
    },
    FieldSpec {
        name: FIELD_STATUS,
        kind: FieldKind::Text,
        critical: true,
        nullable: false,
        salient: Some(ConflictFamily::Status),
        crisis_sensitive: false,
    },
    FieldSpec {
        name: FIELD_CRISIS_MODE,
        kind: FieldKind::Bool,
        critical: true,
        nullable: false,
        salient: Some(ConflictFamily::Crisis),
        crisis_sensitive: true,
    },
    FieldSpec {
        name: FIELD_CRISIS_OVERRIDE,
        kind: FieldKind::Override,
        critical: false,
        nullable: true,
        salient: Some(ConflictFamily::Crisis),
        crisis_sensitive: true,
    },
    FieldSpec {
        name: FIELD_THERAPEUTIC_ACCESS,
        kind: FieldKind::Bool,
        critical: false,
        nullable: false,
        salient: None,
        crisis_sensitive: true,
    },
    FieldSpec {
        name: FIELD_EMERGENCY_ACCESS,
        kind: FieldKind::Bool,
        critical: false,
        nullable: false,
        salient: None,
        crisis_sensitive: true,
    },
    FieldSpec {
        name: FIELD_TRIAL_ENDS_AT,
        kind: FieldKind::Time,
        critical: false,
        nullable: true,
        salient: None,
        crisis_sensitive: false,
    },
    FieldSpec {
        name: FIELD_UPDATED_AT,
        kind: FieldKind::Time,
        critical: false,
        nullable: false,
        salient: None,
        crisis_sensitive: false,
    },
];

/// Look up the schema entry for a field
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELD_SCHEMA.iter().find(|s| s.name == name)
}

/// Fields whose absence is corruption
pub fn critical_fields() -> impl Iterator<Item = &'static FieldSpec> {
    FIELD_SCHEMA.iter().filter(|s| s.critical)
}

/// Fields compared across devices
pub fn salient_fields() -> impl Iterator<Item = (&'static FieldSpec, ConflictFamily)> {
    FIELD_SCHEMA
        .iter()
        .filter_map(|s| s.salient.map(|family| (s, family)))
}

/// Subscription tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Family,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Family => "family",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "family" => Some(Tier::Family),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<SubscriptionStatus> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}
