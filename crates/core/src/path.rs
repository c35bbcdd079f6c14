//! Hierarchical record paths (`/var/jobmesh/jobs/<name>`).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Characters a record name may contain verbatim.
pub const ALLOWED_NAME_CHARS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ abcdefghijklmnopqrstuvwxyz0123456789_,.-+*#!¤$%&()=[]?";

/// Substitute for runs of disallowed characters.
pub const REPLACEMENT_CHAR: char = '_';

/// Map an arbitrary string onto a valid record name.
///
/// Runs of disallowed characters collapse into a single `_`, a leading digit
/// is prefixed with `_`, and an empty result becomes `_`.
pub fn filter_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_added: Option<char> = None;

    for (i, c) in raw.chars().enumerate() {
        let to_add = if !ALLOWED_NAME_CHARS.contains(c) {
            if last_added == Some(REPLACEMENT_CHAR) {
                continue;
            }
            REPLACEMENT_CHAR
        } else {
            if i == 0 && c.is_ascii_digit() {
                out.push(REPLACEMENT_CHAR);
            }
            c
        };
        out.push(to_add);
        last_added = Some(to_add);
    }

    if out.is_empty() {
        out.push(REPLACEMENT_CHAR);
    }
    out
}

/// Absolute, `/`-separated path of a record in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPath(String);

impl RecordPath {
    /// The store root (`/`).
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and validate an absolute path. A trailing `/` is dropped.
    pub fn new(path: impl AsRef<str>) -> Result<Self, CoreError> {
        let raw = path.as_ref();
        if !raw.starts_with('/') {
            return Err(CoreError::invalid_path(format!("'{raw}' is not absolute")));
        }
        if raw == "/" {
            return Ok(Self::root());
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed[1..].split('/').any(str::is_empty) {
            return Err(CoreError::invalid_path(format!("'{raw}' has an empty segment")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Append a single child name.
    pub fn join(&self, name: &str) -> Result<Self, CoreError> {
        if name.is_empty() || name.contains('/') {
            return Err(CoreError::invalid_path(format!("'{name}' is not a valid record name")));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => None,
        }
    }

    /// Ancestors from the root down to (excluding) this path.
    pub fn ancestors(&self) -> Vec<Self> {
        let mut chain = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            chain.push(p);
        }
        chain.reverse();
        chain
    }

    /// True when `self` lies strictly below `other`.
    pub fn is_descendant_of(&self, other: &RecordPath) -> bool {
        if other.is_root() {
            return !self.is_root();
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0.as_bytes()[other.0.len()] == b'/'
    }

    /// True for `other` itself or anything below it.
    pub fn is_within(&self, other: &RecordPath) -> bool {
        self == other || self.is_descendant_of(other)
    }
}

impl core::fmt::Display for RecordPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RecordPath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordPath> for String {
    fn from(value: RecordPath) -> Self {
        value.0
    }
}
