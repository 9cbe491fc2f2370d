//! Records and Cell Values
//!
//! A record stores its cells in a [`RecordData`] map keyed by field ID. Cell
//! values are a closed sum type ([`CellValue`]) so the engine never has to
//! guess a value's shape; the untyped JSON form only appears at the edges
//! (event payloads, real-time broadcasts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Record identifier
pub type RecordId = String;

/// The value held by one cell
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    /// No value
    #[default]
    Null,

    /// Tombstone left by a failed calculation
    Unset,

    Bool(bool),
    Number(f64),
    Text(String),

    /// Linked record IDs
    Links(Vec<RecordId>),

    List(Vec<CellValue>),
}

impl CellValue {
    /// `Null` and `Unset` both count as empty
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Null | CellValue::Unset)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Untyped JSON form used in event payloads and broadcasts
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null | CellValue::Unset => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Links(ids) => {
                Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect())
            }
            CellValue::List(items) => Value::Array(items.iter().map(CellValue::to_json).collect()),
        }
    }

    /// Best-effort conversion from untyped JSON
    ///
    /// Objects are not representable and become their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Null),
            Value::String(s) => CellValue::Text(s.clone()),
            Value::Array(items) => CellValue::List(items.iter().map(CellValue::from_json).collect()),
            Value::Object(_) => CellValue::Text(value.to_string()),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// Ordered mapping from field ID to cell value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordData(BTreeMap<String, CellValue>);

impl RecordData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field_id: &str) -> Option<&CellValue> {
        self.0.get(field_id)
    }

    /// Returns the previous value, if any
    pub fn insert(&mut self, field_id: impl Into<String>, value: CellValue) -> Option<CellValue> {
        self.0.insert(field_id.into(), value)
    }

    pub fn remove(&mut self, field_id: &str) -> Option<CellValue> {
        self.0.remove(field_id)
    }

    pub fn contains(&self, field_id: &str) -> bool {
        self.0.contains_key(field_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CellValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style insert, handy in tests and fixtures
    pub fn with(mut self, field_id: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.insert(field_id, value.into());
        self
    }

    /// JSON object of every cell, keyed by field ID
    pub fn to_json_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl FromIterator<(String, CellValue)> for RecordData {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for RecordData {
    type Item = (String, CellValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, CellValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A row of a table
///
/// `version` starts at 1 and increases by exactly one per committed mutation;
/// writers compare it to detect stale reads (optimistic concurrency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub table_id: String,
    pub data: RecordData,
    pub version: i64,
    pub created_by: String,
    pub modified_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Record {
    /// Create an unsaved record (version 1) with a generated ID
    pub fn new(table_id: impl Into<String>, data: RecordData, actor: impl Into<String>) -> Self {
        let now = Utc::now();
        let actor = actor.into();
        Self {
            id: Uuid::new_v4().to_string(),
            table_id: table_id.into(),
            data,
            version: 1,
            created_by: actor.clone(),
            modified_by: actor,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn get(&self, field_id: &str) -> Option<&CellValue> {
        self.data.get(field_id)
    }

    /// Stamp a mutation: bump the version and audit metadata
    pub fn touch(&mut self, actor: impl Into<String>) {
        self.version += 1;
        self.modified_by = actor.into();
        self.modified_at = Utc::now();
    }
}
