//! Flat event-record model and value coercion shared across the drover pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "drover-core";

/// Longest stringified value the ingestion endpoint accepts per attribute.
pub const MAX_FIELD_CHARS: usize = 4096;

pub const EVENT_TYPE_KEY: &str = "eventType";
pub const ENTITY_ID_KEY: &str = "entity_id";
pub const ENTITY_NAME_KEY: &str = "entity_name";
pub const SOURCE_KEY: &str = "dbt_source";
pub const SOURCE_NAME: &str = "Dbt Cloud";

pub const JOB_RUN_EVENT: &str = "dbt_job_run";
pub const RESOURCE_RUN_EVENT: &str = "dbt_resource_run";
pub const FAILED_TEST_ROW_EVENT: &str = "dbt_failed_test_row";

pub type JsonMap = serde_json::Map<String, JsonValue>;

/// A single event attribute. The ingestion endpoint accepts scalars only,
/// so everything structured is stringified before it gets here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Int(value) => JsonValue::from(*value),
            FieldValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Bool(value) => JsonValue::from(*value),
            FieldValue::Text(text) => JsonValue::from(text.clone()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// One flattened event, ready for upload. Keys are ordered so serialized
/// payloads are stable across runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(FieldValue::as_i64)
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Folds `other` into `self`; colliding keys take the incoming value.
    pub fn merge(&mut self, other: Record) {
        self.fields.extend(other.fields);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn to_json_map(&self) -> JsonMap {
        self.fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect()
    }
}

/// Flattens one level of an attribute bag into a [`Record`], prefixing every
/// key. Identifier keys (ending in `_id`, or exactly `id`) always coerce to
/// text; numbers and booleans pass through; everything else is stringified
/// and truncated to [`MAX_FIELD_CHARS`]. Reapplying with an empty prefix is
/// a no-op.
pub fn flatten(input: &JsonMap, prefix: &str) -> Record {
    let mut record = Record::new();
    for (key, value) in input {
        let field = format!("{prefix}{key}");
        if key.ends_with("_id") || key == "id" {
            record.insert(field, stringify(value));
            continue;
        }
        match value {
            JsonValue::Number(number) => {
                if let Some(int) = number.as_i64() {
                    record.insert(field, int);
                } else if let Some(float) = number.as_f64() {
                    record.insert(field, float);
                } else {
                    record.insert(field, number.to_string());
                }
            }
            JsonValue::Bool(flag) => record.insert(field, *flag),
            other => record.insert(field, truncate_chars(stringify(other), MAX_FIELD_CHARS)),
        }
    }
    record
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((index, _)) = text.char_indices().nth(max_chars) {
        text.truncate(index);
    }
    text
}

/// Mints the unique identifier attached to every uploaded event.
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn entity_display_name(label: &str, created_at: &str) -> String {
    format!("{label} - {created_at}")
}

/// Half-open UTC interval one synchronization pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending `lag_minutes` before `now`, spanning `interval_minutes`.
    /// The lag leaves the upstream API time to finish indexing recent runs.
    pub fn lagged(now: DateTime<Utc>, interval_minutes: i64, lag_minutes: i64) -> Self {
        let end = now - Duration::minutes(lag_minutes);
        let start = end - Duration::minutes(interval_minutes);
        Self { start, end }
    }
}
