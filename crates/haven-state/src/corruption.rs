//! Corruption detection
//!
//! Pure validation of an [`AccountState`] against the field schema. No I/O,
//! one pass over the schema plus two semantic rules, so it is safe to call on
//! every read path.

use std::fmt;

use serde::{Deserialize, Serialize};

use haven_core::{
    critical_fields, field_spec, AccountState, CheckpointId, FieldKind, FieldValue, ReportId,
    SubscriptionStatus, Tier, Timestamp, FIELD_CRISIS_MODE, FIELD_CRISIS_OVERRIDE, FIELD_SCHEMA,
    FIELD_STATUS, FIELD_TIER,
};

/// Corruption classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    MissingField,
    InvalidStructure,
    SemanticViolation,
}

impl CorruptionType {
    /// Tie-break rank when findings share a severity
    fn rank(self) -> u8 {
        match self {
            CorruptionType::MissingField => 0,
            CorruptionType::InvalidStructure => 1,
            CorruptionType::SemanticViolation => 2,
        }
    }
}

/// Report severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(s)
    }
}

/// A single rule violation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionFinding {
    pub field: String,
    pub corruption_type: CorruptionType,
    pub severity: Severity,
    pub crisis_impact: bool,
    pub detail: String,
}

/// Aggregated corruption report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub id: ReportId,
    pub detected_at: Timestamp,
    pub corruption_type: CorruptionType,
    pub affected_fields: Vec<String>,
    pub severity: Severity,
    pub auto_recoverable: bool,
    pub crisis_impact: bool,
    pub last_valid_checkpoint: Option<CheckpointId>,
    pub findings: Vec<CorruptionFinding>,
}

impl CorruptionReport {
    /// Build a report from findings, `None` when there are none.
    /// INVARIANT: crisis_impact => severity == High
    pub fn from_findings(
        id: ReportId,
        detected_at: Timestamp,
        findings: Vec<CorruptionFinding>,
    ) -> Option<Self> {
        let worst = findings.iter().max_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.corruption_type.rank().cmp(&b.corruption_type.rank()))
        })?;

        let crisis_impact = findings.iter().any(|f| f.crisis_impact);
        let severity = if crisis_impact {
            Severity::High
        } else {
            worst.severity
        };
        let corruption_type = if crisis_impact {
            CorruptionType::SemanticViolation
        } else {
            worst.corruption_type
        };

        let mut affected_fields: Vec<String> = Vec::with_capacity(findings.len());
        for f in &findings {
            if !affected_fields.contains(&f.field) {
                affected_fields.push(f.field.clone());
            }
        }

        Some(CorruptionReport {
            id,
            detected_at,
            corruption_type,
            affected_fields,
            severity,
            auto_recoverable: !crisis_impact,
            crisis_impact,
            last_valid_checkpoint: None,
            findings,
        })
    }

    pub fn affects(&self, field: &str) -> bool {
        self.affected_fields.iter().any(|f| f == field)
    }
}

/// Stateless corruption detector
#[derive(Clone, Copy, Debug, Default)]
pub struct CorruptionDetector;

impl CorruptionDetector {
    pub fn new() -> Self {
        CorruptionDetector
    }

    /// Full validation. Report id is left at zero for the caller to assign.
    pub fn detect(&self, state: &AccountState, now: Timestamp) -> Option<CorruptionReport> {
        CorruptionReport::from_findings(ReportId::ZERO, now, self.findings(state))
    }

    /// Whether the state passes every rule
    pub fn is_clean(&self, state: &AccountState) -> bool {
        self.findings(state).is_empty()
    }

    /// All rule violations, in schema order
    pub fn findings(&self, state: &AccountState) -> Vec<CorruptionFinding> {
        let mut findings = Vec::new();

        for spec in FIELD_SCHEMA {
            match state.get(spec.name) {
                None => {
                    if spec.critical {
                        findings.push(missing(spec.name));
                    }
                }
                Some(FieldValue::Null) if !spec.nullable => {
                    if spec.critical {
                        findings.push(missing(spec.name));
                    } else {
                        findings.push(mistyped(spec.name, spec.kind, FieldKind::Null, false));
                    }
                }
                Some(value) => {
                    let kind = value.kind();
                    if kind != spec.kind && kind != FieldKind::Null {
                        findings.push(mistyped(spec.name, spec.kind, kind, spec.critical));
                    }
                }
            }
        }

        if let Some(tier) = state.get(FIELD_TIER).and_then(FieldValue::as_text) {
            if Tier::parse(tier).is_none() {
                findings.push(unknown_vocabulary(FIELD_TIER, tier));
            }
        }
        if let Some(status) = state.get(FIELD_STATUS).and_then(FieldValue::as_text) {
            if SubscriptionStatus::parse(status).is_none() {
                findings.push(unknown_vocabulary(FIELD_STATUS, status));
            }
        }

        if let Some(finding) = self.check_crisis(state) {
            findings.push(finding);
        }

        findings
    }

    /// Crisis consistency only: crisis mode on with no override installed.
    /// Run first and most often when a crisis is active.
    pub fn check_crisis(&self, state: &AccountState) -> Option<CorruptionFinding> {
        if !state.crisis_mode() {
            return None;
        }
        match state.get(FIELD_CRISIS_OVERRIDE) {
            Some(FieldValue::Override(_)) => None,
            _ => Some(CorruptionFinding {
                field: FIELD_CRISIS_OVERRIDE.to_string(),
                corruption_type: CorruptionType::SemanticViolation,
                severity: Severity::High,
                crisis_impact: true,
                detail: "crisis mode active without an override".to_string(),
            }),
        }
    }

    /// Critical fields present in `state` with a value of the schema kind
    pub fn valid_field(&self, state: &AccountState, field: &str) -> bool {
        let Some(spec) = field_spec(field) else {
            return state.contains(field);
        };
        match state.get(field) {
            None => !spec.critical,
            Some(FieldValue::Null) => spec.nullable,
            Some(v) => v.kind() == spec.kind,
        }
    }

    /// Number of critical fields the detector guards
    pub fn critical_field_count(&self) -> usize {
        critical_fields().count()
    }
}

/// Free-function form of [`CorruptionDetector::detect`]
pub fn detect_corruption(state: &AccountState, now: Timestamp) -> Option<CorruptionReport> {
    CorruptionDetector.detect(state, now)
}

fn missing(field: &str) -> CorruptionFinding {
    CorruptionFinding {
        field: field.to_string(),
        corruption_type: CorruptionType::MissingField,
        severity: Severity::Medium,
        crisis_impact: false,
        detail: "critical field missing".to_string(),
    }
}

fn mistyped(field: &str, expected: FieldKind, actual: FieldKind, critical: bool) -> CorruptionFinding {
    CorruptionFinding {
        field: field.to_string(),
        corruption_type: CorruptionType::InvalidStructure,
        severity: if critical { Severity::High } else { Severity::Medium },
        crisis_impact: false,
        detail: format!("expected {}, found {}", expected, actual),
    }
}

fn unknown_vocabulary(field: &str, value: &str) -> CorruptionFinding {
    CorruptionFinding {
        field: field.to_string(),
        corruption_type: CorruptionType::SemanticViolation,
        severity: Severity::Medium,
        crisis_impact: false,
        detail: format!("unknown value '{}'", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::{CrisisOverride, OverrideFlags, OverrideId, FIELD_USER_ID};

    fn clean() -> AccountState {
        AccountState::for_user("u-1", "basic")
    }

    #[test]
    fn test_clean_state_has_no_report() {
        assert!(detect_corruption(&clean(), Timestamp::ZERO).is_none());
    }

    #[test]
    fn test_missing_critical_field_is_medium() {
        let mut state = clean();
        state.remove(FIELD_TIER);

        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.corruption_type, CorruptionType::MissingField);
        assert_eq!(report.severity, Severity::Medium);
        assert_eq!(report.affected_fields, vec![FIELD_TIER.to_string()]);
        assert!(report.auto_recoverable);
        assert!(!report.crisis_impact);
    }

    #[test]
    fn test_null_critical_field_counts_as_missing() {
        let mut state = clean();
        state.set(FIELD_TIER, FieldValue::Null);

        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.corruption_type, CorruptionType::MissingField);
    }

    #[test]
    fn test_crisis_mode_without_override_is_high() {
        let mut state = clean();
        state.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        state.set(FIELD_CRISIS_OVERRIDE, FieldValue::Null);

        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.severity, Severity::High);
        assert!(report.crisis_impact);
        assert!(!report.auto_recoverable);
        assert_eq!(report.corruption_type, CorruptionType::SemanticViolation);
    }

    #[test]
    fn test_crisis_impact_forces_high_even_with_other_findings() {
        let mut state = clean();
        state.remove(FIELD_USER_ID);
        state.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        state.remove(FIELD_CRISIS_OVERRIDE);

        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.severity, Severity::High);
        assert!(report.affects(FIELD_USER_ID));
        assert!(report.affects(FIELD_CRISIS_OVERRIDE));
    }

    #[test]
    fn test_crisis_mode_with_override_is_clean() {
        let mut state = clean();
        state.set(FIELD_CRISIS_MODE, FieldValue::Bool(true));
        state.apply_override(&CrisisOverride::new(
            OverrideId::new(1),
            "test",
            Timestamp::ZERO,
            Timestamp::MAX,
            OverrideFlags::FULL,
        ));
        assert!(CorruptionDetector::new().is_clean(&state));
    }

    #[test]
    fn test_type_mismatch_severity_follows_criticality() {
        let mut state = clean();
        state.set(FIELD_TIER, FieldValue::Int(3));
        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.corruption_type, CorruptionType::InvalidStructure);
        assert_eq!(report.severity, Severity::High);

        let mut state = clean();
        state.set(haven_core::FIELD_TRIAL_ENDS_AT, FieldValue::text("tomorrow"));
        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.severity, Severity::Medium);
    }

    #[test]
    fn test_unknown_tier_is_semantic() {
        let mut state = clean();
        state.set(FIELD_TIER, FieldValue::text("platinum"));
        let report = detect_corruption(&state, Timestamp::ZERO).unwrap();
        assert_eq!(report.corruption_type, CorruptionType::SemanticViolation);
        assert_eq!(report.severity, Severity::Medium);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut state = clean();
        state.set("theme", FieldValue::text("dark"));
        assert!(detect_corruption(&state, Timestamp::ZERO).is_none());
    }
}
