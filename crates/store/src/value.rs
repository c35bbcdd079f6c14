//! Record values and record snapshots.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobmesh_core::{RecordPath, SessionId};

/// A property value as the store persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl Value {
    /// Ordering between values of the same kind; `None` across kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

/// Record property map.
pub type Properties = BTreeMap<String, Value>;

/// State of a live lock on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Session holding the token; `None` while the token is being transferred.
    pub holder: Option<SessionId>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub session_scoped: bool,
}

/// Point-in-time snapshot of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub path: RecordPath,
    pub properties: Properties,
    pub lock: Option<LockInfo>,
}

impl Record {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.property(name) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.property(name) {
            Some(Value::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn date(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.property(name) {
            Some(Value::Date(d)) => Some(*d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_compare_within_a_kind_only() {
        assert_eq!(Value::Long(1).compare(&Value::Long(2)), Some(Ordering::Less));
        assert_eq!(Value::Long(1).compare(&Value::Double(2.0)), None);
    }

    #[test]
    fn typed_accessors_ignore_other_kinds() {
        let mut properties = Properties::new();
        properties.insert("a".into(), Value::from("true"));
        let record = Record {
            path: RecordPath::new("/x").unwrap(),
            properties,
            lock: None,
        };
        assert_eq!(record.boolean("a"), None);
        assert_eq!(record.string("a"), Some("true"));
    }
}
