//! Domain Events
//!
//! Immutable records of "what happened", appended to the
//! [`TransactionContext`](super::TransactionContext) while a unit of work runs
//! and published on the event bus only after it commits. A rolled-back unit of
//! work discards its events.
//!
//! # Deduplication
//!
//! Before publication the event list is collapsed with [`dedup_events`]: for
//! each `(kind, aggregate_type, aggregate_id, table_id)` key only the last event
//! survives. "Record updated three times in one transaction" reaches
//! subscribers once, carrying the final field values.

use crate::models::{Field, FieldId, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    FieldCreated,
    FieldUpdated,
    FieldDeleted,
}

impl EventKind {
    /// Aggregate the event is about
    pub fn aggregate_type(&self) -> &'static str {
        match self {
            EventKind::RecordCreated | EventKind::RecordUpdated | EventKind::RecordDeleted => "record",
            EventKind::FieldCreated | EventKind::FieldUpdated | EventKind::FieldDeleted => "field",
        }
    }

    pub fn is_field_event(&self) -> bool {
        self.aggregate_type() == "field"
    }
}

/// An immutable record of a committed change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: String,
    pub kind: EventKind,
    pub aggregate_type: String,
    pub aggregate_id: String,

    /// Sub-aggregate: the table the record or field belongs to
    pub table_id: String,

    /// Opaque key/value payload
    pub payload: Map<String, Value>,

    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        kind: EventKind,
        aggregate_id: impl Into<String>,
        table_id: impl Into<String>,
        payload: Map<String, Value>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            aggregate_type: kind.aggregate_type().to_string(),
            aggregate_id: aggregate_id.into(),
            table_id: table_id.into(),
            payload,
            actor: actor.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn record_created(record: &Record) -> Self {
        Self::new(
            EventKind::RecordCreated,
            &record.id,
            &record.table_id,
            record_payload(record, &[]),
            &record.modified_by,
        )
    }

    /// `changed_fields` lists every field whose value changed, computed ones included
    pub fn record_updated(record: &Record, changed_fields: &[FieldId]) -> Self {
        Self::new(
            EventKind::RecordUpdated,
            &record.id,
            &record.table_id,
            record_payload(record, changed_fields),
            &record.modified_by,
        )
    }

    pub fn record_deleted(record: &Record, actor: &str) -> Self {
        Self::new(
            EventKind::RecordDeleted,
            &record.id,
            &record.table_id,
            record_payload(record, &[]),
            actor,
        )
    }

    pub fn field_event(kind: EventKind, field: &Field, actor: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("name".into(), Value::String(field.name.clone()));
        payload.insert("type".into(), Value::String(field.field_type().as_str().to_string()));
        payload.insert("computed".into(), Value::Bool(field.is_computed()));
        Self::new(kind, &field.id, &field.table_id, payload, actor)
    }

    /// Get a string representation of the event type
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::RecordCreated => "record:created",
            EventKind::RecordUpdated => "record:updated",
            EventKind::RecordDeleted => "record:deleted",
            EventKind::FieldCreated => "field:created",
            EventKind::FieldUpdated => "field:updated",
            EventKind::FieldDeleted => "field:deleted",
        }
    }

    /// Field values carried by record events
    pub fn fields(&self) -> Map<String, Value> {
        match self.payload.get("fields") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Changed field IDs carried by `RecordUpdated`
    pub fn changed_fields(&self) -> Vec<FieldId> {
        match self.payload.get("changedFields") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// How many cross-record recalculation hops led to this event (0 = user write)
    pub fn cascade_depth(&self) -> u32 {
        self.payload
            .get("cascadeDepth")
            .and_then(Value::as_u64)
            .map(|d| d as u32)
            .unwrap_or(0)
    }

    /// Record the cascade depth; depth 0 leaves the payload untouched
    pub fn with_cascade_depth(mut self, depth: u32) -> Self {
        if depth > 0 {
            self.payload.insert("cascadeDepth".into(), json!(depth));
        }
        self
    }

    /// Key under which events collapse during deduplication
    pub fn dedup_key(&self) -> (EventKind, &str, &str, &str) {
        (
            self.kind,
            self.aggregate_type.as_str(),
            self.aggregate_id.as_str(),
            self.table_id.as_str(),
        )
    }
}

fn record_payload(record: &Record, changed_fields: &[FieldId]) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("fields".into(), Value::Object(record.data.to_json_map()));
    payload.insert("version".into(), json!(record.version));
    if !changed_fields.is_empty() {
        payload.insert("changedFields".into(), json!(changed_fields));
    }
    payload
}

/// Keep only the last event per dedup key, in order of last occurrence
///
/// Collapsed `RecordUpdated` events keep the union of their changed fields so
/// downstream recomputation still sees every touched field.
pub fn dedup_events(events: Vec<DomainEvent>) -> Vec<DomainEvent> {
    if events.len() < 2 {
        return events;
    }

    let mut last_index: HashMap<(EventKind, String, String, String), usize> = HashMap::new();
    let mut changed: HashMap<usize, Vec<FieldId>> = HashMap::new();

    for (i, event) in events.iter().enumerate() {
        let (kind, aggregate_type, aggregate_id, table_id) = event.dedup_key();
        let key = (
            kind,
            aggregate_type.to_string(),
            aggregate_id.to_string(),
            table_id.to_string(),
        );
        let previous = last_index.insert(key, i);
        if event.kind == EventKind::RecordUpdated {
            let mut fields = previous.and_then(|p| changed.remove(&p)).unwrap_or_default();
            for field in event.changed_fields() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
            changed.insert(i, fields);
        }
    }

    let mut keep: Vec<usize> = last_index.into_values().collect();
    keep.sort_unstable();

    let mut events: Vec<Option<DomainEvent>> = events.into_iter().map(Some).collect();
    keep.into_iter()
        .filter_map(|i| {
            let mut event = events[i].take()?;
            if let Some(fields) = changed.remove(&i) {
                if !fields.is_empty() {
                    event.payload.insert("changedFields".into(), json!(fields));
                }
            }
            Some(event)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordData;

    fn record(id: &str, a: f64) -> Record {
        let mut record = Record::new("t1", RecordData::new().with("a", a), "alice");
        record.id = id.to_string();
        record
    }

    #[test]
    fn test_last_update_wins() {
        let events = vec![
            DomainEvent::record_updated(&record("r1", 1.0), &["a".to_string()]),
            DomainEvent::record_updated(&record("r2", 7.0), &["a".to_string()]),
            DomainEvent::record_updated(&record("r1", 2.0), &["b".to_string()]),
            DomainEvent::record_updated(&record("r1", 3.0), &["a".to_string()]),
        ];

        let deduped = dedup_events(events);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].aggregate_id, "r2");
        assert_eq!(deduped[1].aggregate_id, "r1");
        assert_eq!(deduped[1].fields().get("a"), Some(&json!(3.0)));
        assert_eq!(deduped[1].changed_fields(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_different_kinds_do_not_collapse() {
        let r = record("r1", 1.0);
        let events = vec![
            DomainEvent::record_created(&r),
            DomainEvent::record_updated(&r, &["a".to_string()]),
            DomainEvent::record_deleted(&r, "alice"),
        ];
        let kinds: Vec<EventKind> = dedup_events(events).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::RecordCreated, EventKind::RecordUpdated, EventKind::RecordDeleted]
        );
    }

    #[test]
    fn test_event_type_strings() {
        let r = record("r1", 1.0);
        assert_eq!(DomainEvent::record_created(&r).event_type(), "record:created");
        assert_eq!(DomainEvent::record_created(&r).aggregate_type, "record");

        let field = Field::new("t1", "Name", crate::models::FieldConfig::Text);
        let event = DomainEvent::field_event(EventKind::FieldDeleted, &field, "alice");
        assert_eq!(event.event_type(), "field:deleted");
        assert_eq!(event.table_id, "t1");
        assert_eq!(event.payload["type"], "text");
    }

    #[test]
    fn test_serialization_contract() {
        let event = DomainEvent::record_created(&record("r1", 5.0));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "record_created");
        assert_eq!(value["aggregateId"], "r1");
        assert_eq!(value["payload"]["fields"]["a"], 5.0);
        assert_eq!(value["payload"]["version"], 1);
    }

    #[test]
    fn test_cascade_depth_round_trips_through_payload() {
        let event = DomainEvent::record_created(&record("r1", 5.0));
        assert_eq!(event.cascade_depth(), 0);
        assert!(!event.clone().with_cascade_depth(0).payload.contains_key("cascadeDepth"));
        assert_eq!(event.with_cascade_depth(3).cascade_depth(), 3);
    }
}
