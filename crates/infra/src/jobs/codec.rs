//! Job record codec: event <-> store record.
//!
//! Scalar event properties are stored as record properties of the same name
//! so the store can query them. Lists, JSON values and properties whose name
//! would clash with the reserved `jobmesh:` namespace go into one serialized
//! blob. Transport-only properties and the completion context are never
//! written; on read the completion context is absent and gets attached by the
//! engine for the current execution attempt.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use jobmesh_core::{ProcessId, RecordPath, filter_name};
use jobmesh_events::job::TRANSPORT_ONLY_PROPERTIES;
use jobmesh_events::{Event, Properties as EventProperties, PropertyValue, job_id, job_topic};
use jobmesh_store::{Properties, Record, Value};

pub const PROPERTY_TOPIC: &str = "jobmesh:topic";
pub const PROPERTY_ID: &str = "jobmesh:id";
pub const PROPERTY_EVENT_TOPIC: &str = "jobmesh:eventTopic";
pub const PROPERTY_ACTIVE: &str = "jobmesh:active";
pub const PROPERTY_FINISHED: &str = "jobmesh:finished";
pub const PROPERTY_APPLICATION: &str = "jobmesh:application";
pub const PROPERTY_PROCESSOR: &str = "jobmesh:processor";
pub const PROPERTY_CREATED: &str = "jobmesh:created";
pub const PROPERTY_BLOB: &str = "jobmesh:properties";

const RESERVED_PREFIX: &str = "jobmesh:";

#[derive(Debug, Error)]
#[error("cannot encode job properties: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record {path} has no {property}")]
    MissingProperty { path: RecordPath, property: &'static str },

    #[error("corrupt property blob in {path}: {reason}")]
    CorruptBlob { path: RecordPath, reason: String },

    #[error("unsupported value for {name} in {path}")]
    UnsupportedValue { path: RecordPath, name: String },
}

/// Record name for a job: `"<job topic> <job id>"`, or a random
/// `"Job <uuid>"` when the event has no id, filtered to a safe alphabet.
pub fn record_name(event: &Event) -> String {
    let raw = match job_id(event) {
        Some(id) => format!("{} {id}", job_topic(event).unwrap_or_default()),
        None => format!("Job {}", Uuid::now_v7()),
    };
    filter_name(&raw)
}

fn is_transport_only(name: &str) -> bool {
    TRANSPORT_ONLY_PROPERTIES.contains(&name)
}

fn scalar(value: &PropertyValue) -> Option<Value> {
    match value {
        PropertyValue::String(s) => Some(Value::String(s.clone())),
        PropertyValue::Long(n) => Some(Value::Long(*n)),
        PropertyValue::Double(d) => Some(Value::Double(*d)),
        PropertyValue::Boolean(b) => Some(Value::Boolean(*b)),
        PropertyValue::Date(d) => Some(Value::Date(*d)),
        PropertyValue::StringList(_) | PropertyValue::Json(_) => None,
    }
}

/// Check that every persisted property of `event` survives a write/read
/// cycle. Non-finite doubles have no JSON form.
pub fn validate(event: &Event) -> Result<(), EncodeError> {
    let bad = event.properties().iter().find(|(name, value)| {
        !is_transport_only(name) && matches!(value, PropertyValue::Double(d) if !d.is_finite())
    });
    match bad {
        Some((name, _)) => Err(EncodeError(format!("{name} is not a finite number"))),
        None => Ok(()),
    }
}

/// Record properties for a freshly written, active job created by `creator`.
pub fn write(event: &Event, creator: ProcessId, now: DateTime<Utc>) -> Result<Properties, EncodeError> {
    validate(event)?;
    let mut record = Properties::new();
    let mut blob = EventProperties::new();

    for (name, value) in event.properties() {
        if is_transport_only(name) {
            continue;
        }
        match scalar(value) {
            Some(v) if !name.contains(':') => {
                record.insert(name.clone(), v);
            }
            _ => {
                blob.insert(name.clone(), value.clone());
            }
        }
    }

    if !blob.is_empty() {
        let bytes = serde_json::to_vec(&blob).map_err(|e| EncodeError(e.to_string()))?;
        record.insert(PROPERTY_BLOB.into(), Value::Binary(bytes));
    }

    record.insert(PROPERTY_EVENT_TOPIC.into(), Value::from(event.topic()));
    if let Some(topic) = job_topic(event) {
        record.insert(PROPERTY_TOPIC.into(), Value::from(topic));
    }
    if let Some(id) = job_id(event) {
        record.insert(PROPERTY_ID.into(), Value::from(id));
    }
    record.insert(PROPERTY_ACTIVE.into(), Value::Boolean(true));
    record.insert(PROPERTY_APPLICATION.into(), Value::from(creator.to_string()));
    record.insert(PROPERTY_CREATED.into(), Value::Date(now));
    Ok(record)
}

/// Rebuild the event stored in `record`.
pub fn read(record: &Record) -> Result<Event, DecodeError> {
    let topic = record
        .string(PROPERTY_EVENT_TOPIC)
        .ok_or_else(|| DecodeError::MissingProperty {
            path: record.path.clone(),
            property: PROPERTY_EVENT_TOPIC,
        })?;

    let mut properties = EventProperties::new();
    for (name, value) in &record.properties {
        if name.starts_with(RESERVED_PREFIX) {
            continue;
        }
        let value = match value {
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::Long(n) => PropertyValue::Long(*n),
            Value::Double(d) => PropertyValue::Double(*d),
            Value::Boolean(b) => PropertyValue::Boolean(*b),
            Value::Date(d) => PropertyValue::Date(*d),
            Value::Binary(_) => {
                return Err(DecodeError::UnsupportedValue {
                    path: record.path.clone(),
                    name: name.clone(),
                });
            }
        };
        properties.insert(name.clone(), value);
    }

    match record.property(PROPERTY_BLOB) {
        None => {}
        Some(Value::Binary(bytes)) => {
            let blob: EventProperties =
                serde_json::from_slice(bytes).map_err(|e| DecodeError::CorruptBlob {
                    path: record.path.clone(),
                    reason: e.to_string(),
                })?;
            properties.extend(blob);
        }
        Some(_) => {
            return Err(DecodeError::CorruptBlob {
                path: record.path.clone(),
                reason: "blob is not binary".into(),
            });
        }
    }

    Ok(Event::new(topic, properties))
}

pub fn is_active(record: &Record) -> bool {
    record.boolean(PROPERTY_ACTIVE) == Some(true)
}

/// Lifecycle view of a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub path: RecordPath,
    pub topic: Option<String>,
    pub id: Option<String>,
    pub active: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub application: Option<String>,
    pub processor: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub locked: bool,
}

impl JobRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            path: record.path.clone(),
            topic: record.string(PROPERTY_TOPIC).map(str::to_string),
            id: record.string(PROPERTY_ID).map(str::to_string),
            active: is_active(record),
            finished_at: record.date(PROPERTY_FINISHED),
            application: record.string(PROPERTY_APPLICATION).map(str::to_string),
            processor: record.string(PROPERTY_PROCESSOR).map(str::to_string),
            created_at: record.date(PROPERTY_CREATED),
            locked: record.is_locked(),
        }
    }

    /// True when `process` wrote this record.
    pub fn created_by(&self, process: ProcessId) -> bool {
        self.application.as_deref() == Some(process.to_string().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_events::job::{PROPERTY_APPLICATION as EVENT_APPLICATION, PROPERTY_DISTRIBUTE};
    use jobmesh_events::job_request;
    use proptest::prelude::*;

    fn to_record(props: Properties) -> Record {
        Record {
            path: RecordPath::new("/jobs/x").unwrap(),
            properties: props,
            lock: None,
        }
    }

    #[test]
    fn record_name_combines_topic_and_id() {
        let ev = job_request("org/acme/report", "42");
        assert_eq!(record_name(&ev), "org_acme_report 42");
    }

    #[test]
    fn record_name_without_id_is_unique() {
        let ev = Event::new("jobmesh/job", EventProperties::new()).with_property(
            jobmesh_events::job::PROPERTY_JOB_TOPIC,
            "t",
        );
        let a = record_name(&ev);
        let b = record_name(&ev);
        assert!(a.starts_with("Job "));
        assert_ne!(a, b);
    }

    #[test]
    fn write_adds_lifecycle_fields() {
        let creator = ProcessId::new();
        let now = Utc::now();
        let props = write(&job_request("t1", "j1"), creator, now).unwrap();

        assert_eq!(props.get(PROPERTY_TOPIC), Some(&Value::from("t1")));
        assert_eq!(props.get(PROPERTY_ID), Some(&Value::from("j1")));
        assert_eq!(props.get(PROPERTY_ACTIVE), Some(&Value::Boolean(true)));
        assert_eq!(props.get(PROPERTY_CREATED), Some(&Value::Date(now)));

        let view = JobRecord::from_record(&to_record(props));
        assert!(view.created_by(creator));
        assert!(!view.created_by(ProcessId::new()));
        assert!(view.finished_at.is_none());
    }

    #[test]
    fn transport_only_properties_are_not_persisted() {
        let ev = job_request("t", "j")
            .with_property(EVENT_APPLICATION, "elsewhere")
            .with_property(PROPERTY_DISTRIBUTE, true);
        let props = write(&ev, ProcessId::new(), Utc::now()).unwrap();

        assert!(!props.contains_key(EVENT_APPLICATION));
        assert!(!props.contains_key(PROPERTY_DISTRIBUTE));
        assert_eq!(read(&to_record(props)).unwrap(), job_request("t", "j"));
    }

    #[test]
    fn non_scalar_and_namespaced_properties_use_the_blob() {
        let ev = job_request("t", "j")
            .with_property("tags", vec!["a".to_string(), "b".to_string()])
            .with_property("jobmesh:active", "spoof")
            .with_property("payload", serde_json::json!({"k": [1, 2]}));
        let props = write(&ev, ProcessId::new(), Utc::now()).unwrap();

        assert!(!props.contains_key("tags"));
        assert_eq!(props.get(PROPERTY_ACTIVE), Some(&Value::Boolean(true)));
        assert!(matches!(props.get(PROPERTY_BLOB), Some(Value::Binary(_))));
        assert_eq!(read(&to_record(props)).unwrap(), ev);
    }

    #[test]
    fn corrupt_blob_is_a_decode_error() {
        let mut props = write(&job_request("t", "j"), ProcessId::new(), Utc::now()).unwrap();
        props.insert(PROPERTY_BLOB.into(), Value::Binary(b"{not json".to_vec()));

        let err = read(&to_record(props)).unwrap_err();
        assert!(matches!(err, DecodeError::CorruptBlob { .. }));
    }

    #[test]
    fn non_finite_doubles_are_refused() {
        for value in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let ev = job_request("t", "j").with_property("ns:ratio", PropertyValue::Double(value));
            assert!(validate(&ev).is_err());
            assert!(write(&ev, ProcessId::new(), Utc::now()).is_err());
        }
        let plain = job_request("t", "j").with_property("ratio", PropertyValue::Double(f64::NAN));
        assert!(write(&plain, ProcessId::new(), Utc::now()).is_err());
    }

    #[test]
    fn missing_event_topic_is_a_decode_error() {
        let err = read(&to_record(Properties::new())).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingProperty {
                property: PROPERTY_EVENT_TOPIC,
                ..
            }
        ));
    }

    fn property_value() -> impl Strategy<Value = PropertyValue> {
        prop_oneof![
            ".{0,16}".prop_map(PropertyValue::String),
            any::<i64>().prop_map(PropertyValue::Long),
            any::<bool>().prop_map(PropertyValue::Boolean),
            (-1_000_000i32..1_000_000).prop_map(|n| PropertyValue::Double(f64::from(n) / 4.0)),
            prop_oneof![Just(f64::NAN), Just(f64::INFINITY), Just(f64::NEG_INFINITY)]
                .prop_map(PropertyValue::Double),
            proptest::collection::vec("[a-z]{0,6}", 0..4).prop_map(PropertyValue::StringList),
        ]
    }

    proptest! {
        #[test]
        fn read_inverts_write_or_refuses(
            props in proptest::collection::btree_map("[a-z][a-z.:]{0,12}", property_value(), 0..8)
        ) {
            let mut ev = job_request("topic", "id");
            for (name, value) in props {
                if !is_transport_only(&name) {
                    ev.set_property(name, value);
                }
            }

            let non_finite = ev.properties().iter().any(|(name, value)| {
                !is_transport_only(name) && matches!(value, PropertyValue::Double(d) if !d.is_finite())
            });
            match write(&ev, ProcessId::new(), Utc::now()) {
                Ok(written) => {
                    prop_assert!(!non_finite);
                    prop_assert_eq!(read(&to_record(written)).unwrap(), ev);
                }
                Err(_) => prop_assert!(non_finite),
            }
        }
    }
}
