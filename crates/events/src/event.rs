use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::NotifierContext;

/// A typed event property.
///
/// Scalars map directly onto store values; lists and JSON documents are
/// carried in the record's serialized property blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    StringList(Vec<String>),
    Json(serde_json::Value),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted since foreign publishers
    /// often send counters as text.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(v) => Some(*v),
            PropertyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Long(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Event property map (ordered for stable serialization).
pub type Properties = BTreeMap<String, PropertyValue>;

/// An event travelling over the local bus: a topic plus a property map.
///
/// Job events additionally carry a completion context once the engine has
/// claimed them. The context is local to this process: it is never
/// serialized and is ignored by equality.
#[derive(Clone, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    #[serde(default)]
    properties: Properties,
    #[serde(skip)]
    completion: Option<NotifierContext>,
}

impl Event {
    pub fn new(topic: impl Into<String>, properties: Properties) -> Self {
        Self {
            topic: topic.into(),
            properties,
            completion: None,
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(PropertyValue::as_str)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    pub fn completion(&self) -> Option<&NotifierContext> {
        self.completion.as_ref()
    }

    pub fn with_completion(mut self, context: NotifierContext) -> Self {
        self.completion = Some(context);
        self
    }

    /// Copy of this event with the local completion context dropped.
    pub fn without_completion(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            properties: self.properties.clone(),
            completion: None,
        }
    }

    pub fn into_parts(self) -> (String, Properties) {
        (self.topic, self.properties)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic && self.properties == other.properties
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("properties", &self.properties)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}
