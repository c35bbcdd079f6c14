//! Property queries over a subtree.

use std::cmp::Ordering;

use jobmesh_core::RecordPath;

use crate::value::{Record, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(String, Value),
    LessThan(String, Value),
    Locked(bool),
    HasProperty(String),
}

/// Conjunction of conditions evaluated against every record strictly below
/// `root`. Results are snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    root: RecordPath,
    conditions: Vec<Condition>,
}

impl Query {
    pub fn under(root: RecordPath) -> Self {
        Self {
            root,
            conditions: Vec::new(),
        }
    }

    pub fn eq(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Equals(name.into(), value.into()));
        self
    }

    pub fn lt(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::LessThan(name.into(), value.into()));
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.conditions.push(Condition::Locked(locked));
        self
    }

    pub fn has(mut self, name: impl Into<String>) -> Self {
        self.conditions.push(Condition::HasProperty(name.into()));
        self
    }

    pub fn root(&self) -> &RecordPath {
        &self.root
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.path.is_descendant_of(&self.root)
            && self.conditions.iter().all(|c| match c {
                Condition::Equals(name, expected) => record.property(name) == Some(expected),
                Condition::LessThan(name, bound) => record
                    .property(name)
                    .and_then(|v| v.compare(bound))
                    .is_some_and(|o| o == Ordering::Less),
                Condition::Locked(locked) => record.is_locked() == *locked,
                Condition::HasProperty(name) => record.property(name).is_some(),
            })
    }
}
