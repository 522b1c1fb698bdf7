//! Account state container
//!
//! The canonical in-memory object produced by the account-state owner. The
//! engine checkpoints, journals and recovers it but never interprets fields
//! outside the schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    CrisisOverride, FieldValue, Timestamp, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE,
    FIELD_EMERGENCY_ACCESS, FIELD_STATUS, FIELD_THERAPEUTIC_ACCESS, FIELD_TIER, FIELD_USER_ID,
};

/// One payment history record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub paid_at: Timestamp,
    pub description: String,
}

/// Deflated block of payment records moved out of the live history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryArchive {
    pub records: usize,
    pub original_size: usize,
    pub newest_paid_at: Timestamp,
    pub data: Vec<u8>,
}

/// Account state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub payment_history: Vec<PaymentRecord>,
    #[serde(default)]
    pub archived_history: Vec<HistoryArchive>,
}

impl AccountState {
    pub fn new() -> Self {
        AccountState::default()
    }

    /// A well-formed state for a user on `tier` with an active subscription
    pub fn for_user(user_id: &str, tier: &str) -> Self {
        let mut state = AccountState::new();
        state.set(FIELD_USER_ID, FieldValue::text(user_id));
        state.set(FIELD_TIER, FieldValue::text(tier));
        state.set(FIELD_STATUS, FieldValue::text("active"));
        state.set(FIELD_CRISIS_MODE, FieldValue::Bool(false));
        state.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);
        state
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(field.to_string(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn tier(&self) -> Option<&str> {
        self.get(FIELD_TIER).and_then(FieldValue::as_text)
    }

    pub fn crisis_mode(&self) -> bool {
        self.get(FIELD_CRISIS_MODE)
            .and_then(FieldValue::as_bool)
            .unwrap_or(false)
    }

    pub fn crisis_override(&self) -> Option<&CrisisOverride> {
        self.get(FIELD_CRISIS_OVERRIDE).and_then(FieldValue::as_override)
    }

    /// Mirror an override into the crisis-sensitive fields
    pub fn apply_override(&mut self, o: &CrisisOverride) {
        self.set(FIELD_CRISIS_OVERRIDE, FieldValue::from(o.clone()));
        if o.flags.therapeutic_access {
            self.set(FIELD_THERAPEUTIC_ACCESS, FieldValue::Bool(true));
        }
        if o.flags.emergency_access {
            self.set(FIELD_EMERGENCY_ACCESS, FieldValue::Bool(true));
        }
    }

    /// Approximate in-memory footprint of the payment history
    pub fn history_size(&self) -> usize {
        self.payment_history
            .iter()
            .map(|r| 40 + r.id.len() + r.currency.len() + r.description.len())
            .sum()
    }
}
