//! In-flight event representation.
//!
//! An [`EventRecord`] pairs the decoded OCSF body with a [`Metadata`] sidecar
//! of string annotations (ingestion timestamps, derived `tag.*` entries and
//! `<unit>_error` markers). Field access goes through [`Lookup`], which keeps
//! "absent" and "present with the wrong type" apart so callers must handle
//! both explicitly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Result of reading a field out of a semi-structured record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    /// The path does not resolve (segment absent or an intermediate value is
    /// not a mapping).
    Missing,
    /// The path resolves but the value has a different type than requested.
    WrongType,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }

    /// Chains a conversion that may reject the found value as the wrong type.
    pub fn and_then<U, F: FnOnce(T) -> Option<U>>(self, f: F) -> Lookup<U> {
        match self {
            Lookup::Found(v) => f(v).map_or(Lookup::WrongType, Lookup::Found),
            Lookup::Missing => Lookup::Missing,
            Lookup::WrongType => Lookup::WrongType,
        }
    }
}

/// Splits a dotted field path, ignoring empty segments (`"a..b"` is `a.b`).
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Resolves a dotted path by descending one mapping level per segment.
pub fn resolve<'a>(root: &'a Map<String, Value>, path: &str) -> Lookup<&'a Value> {
    let mut segments = split_path(path);
    let Some(first) = segments.next() else {
        return Lookup::Missing;
    };
    let Some(mut current) = root.get(first) else {
        return Lookup::Missing;
    };
    for segment in segments {
        match current.as_object().and_then(|m| m.get(segment)) {
            Some(next) => current = next,
            None => return Lookup::Missing,
        }
    }
    Lookup::Found(current)
}

/// Reads a JSON number as an integer. Floats are accepted only when they
/// carry no fractional part (`2004.0`).
pub fn value_as_i64(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    if let Some(u) = value.as_u64() {
        return i64::try_from(u).ok();
    }
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && f.is_finite())
        .map(|f| f as i64)
}

pub fn str_at<'a>(root: &'a Map<String, Value>, path: &str) -> Lookup<&'a str> {
    resolve(root, path).and_then(Value::as_str)
}

/// Any JSON number, fractional or not.
pub fn f64_at(root: &Map<String, Value>, path: &str) -> Lookup<f64> {
    resolve(root, path).and_then(Value::as_f64)
}

pub fn array_at<'a>(root: &'a Map<String, Value>, path: &str) -> Lookup<&'a Vec<Value>> {
    resolve(root, path).and_then(Value::as_array)
}

pub fn object_at<'a>(root: &'a Map<String, Value>, path: &str) -> Lookup<&'a Map<String, Value>> {
    resolve(root, path).and_then(Value::as_object)
}

/// Key/value annotations that travel with a record, separate from its body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an entry.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Records a per-unit error marker under `<unit>_error`.
    pub fn mark_error(&mut self, unit: &str, message: impl ToString) {
        self.set(format!("{}_error", unit), message.to_string());
    }

    /// Entries whose key starts with `tag.`.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter(|(k, _)| k.starts_with("tag."))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One event travelling through the gateway, the processor chain and into a
/// sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    body: Value,
    metadata: Metadata,
}

impl EventRecord {
    pub fn new(body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            metadata: Metadata::new(),
        }
    }

    pub fn from_object(body: Map<String, Value>) -> Self {
        Self::new(Value::Object(body))
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Body as a mapping. Units that need an object fail the record with
    /// [`PipelineError::RecordFormat`] otherwise.
    pub fn object(&self, unit: &str) -> Result<&Map<String, Value>> {
        self.body
            .as_object()
            .ok_or_else(|| PipelineError::record_format(format!("{} expects object", unit)))
    }

    pub fn object_mut(&mut self, unit: &str) -> Result<&mut Map<String, Value>> {
        self.body
            .as_object_mut()
            .ok_or_else(|| PipelineError::record_format(format!("{} expects object", unit)))
    }

    /// Mutable body and sidecar at once, for units that write both.
    pub fn parts_mut(&mut self) -> (&mut Value, &mut Metadata) {
        (&mut self.body, &mut self.metadata)
    }

    pub fn into_parts(self) -> (Value, Metadata) {
        (self.body, self.metadata)
    }
}
