//! Tagged field values

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CrisisOverride, Timestamp};

/// Kind of a field value, used by the schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Null,
    Bool,
    Int,
    Text,
    Time,
    Override,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Null => "null",
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Text => "text",
            FieldKind::Time => "time",
            FieldKind::Override => "override",
        };
        f.write_str(name)
    }
}

/// A single account-state field value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Time(Timestamp),
    Override(Box<CrisisOverride>),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Null => FieldKind::Null,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Time(_) => FieldKind::Time,
            FieldValue::Override(_) => FieldKind::Override,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_override(&self) -> Option<&CrisisOverride> {
        match self {
            FieldValue::Override(o) => Some(o),
            _ => None,
        }
    }

    /// Canonical bytes used for checksums
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.kind() as u8];
        match self {
            FieldValue::Null => {}
            FieldValue::Bool(b) => out.push(*b as u8),
            FieldValue::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
            FieldValue::Text(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            FieldValue::Time(t) => out.extend_from_slice(&t.as_millis().to_le_bytes()),
            FieldValue::Override(o) => {
                out.extend_from_slice(&o.id.value().to_le_bytes());
                out.extend_from_slice(&o.expires_at.as_millis().to_le_bytes());
            }
        }
        out
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<CrisisOverride> for FieldValue {
    fn from(o: CrisisOverride) -> Self {
        FieldValue::Override(Box::new(o))
    }
}
