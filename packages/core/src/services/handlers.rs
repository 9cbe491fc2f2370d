//! Built-In Event Handlers
//!
//! - [`CacheInvalidationHandler`] drops a table's cached field definitions
//!   when one of its fields changes
//! - [`RecalculationHandler`] recomputes rollups, lookups and counts in other
//!   records that link to a changed or deleted record
//! - [`AuditLogHandler`] keeps an append-only trail of committed events

use crate::calculators::link_ids;
use crate::db::{DomainEvent, EventKind, FieldStore, RecordStore};
use crate::models::{CellValue, Field, FieldId, RecordData};
use crate::services::{EventHandler, FieldCache, RecordService, WriteOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Cross-record recalculation stops after this many hops
pub const MAX_CASCADE_DEPTH: u32 = 8;

/// Actor stamped on mutations made by the recalculation handler
const RECALCULATION_ACTOR: &str = "system:recalculation";

pub struct CacheInvalidationHandler {
    cache: Arc<FieldCache>,
}

impl CacheInvalidationHandler {
    pub fn new(cache: Arc<FieldCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for CacheInvalidationHandler {
    fn name(&self) -> &str {
        "cache-invalidation"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn handles(&self, kind: EventKind) -> bool {
        kind.is_field_event()
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        match event.kind {
            // Deletion flags dependents in any table linking here
            EventKind::FieldDeleted => self.cache.invalidate_all().await,
            _ => self.cache.invalidate(&event.table_id).await,
        }
        Ok(())
    }
}

/// Recomputes dependents of a committed record change in the records linking to it
///
/// Holds the record service weakly: the service owns the transaction manager
/// that publishes to the bus this handler is registered on.
pub struct RecalculationHandler {
    records: Weak<RecordService>,
    field_store: Arc<dyn FieldStore>,
    record_store: Arc<dyn RecordStore>,
}

impl RecalculationHandler {
    pub fn new(
        records: Weak<RecordService>,
        field_store: Arc<dyn FieldStore>,
        record_store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            records,
            field_store,
            record_store,
        }
    }

    /// Computed fields of `fields` going through `link_field_id`
    ///
    /// On update only fields reading one of `changed` qualify; counts never
    /// do, since the number of links did not change.
    fn dependents<'a>(
        fields: &'a [Field],
        link_field_id: &str,
        kind: EventKind,
        changed: &[FieldId],
    ) -> Vec<&'a Field> {
        fields
            .iter()
            .filter(|f| f.config.link_field_id() == Some(link_field_id))
            .filter(|f| match kind {
                EventKind::RecordDeleted => true,
                _ => match f.config.target_field_id() {
                    Some(target) => changed.is_empty() || changed.iter().any(|c| c == target),
                    None => false,
                },
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecalculationHandler {
    fn name(&self) -> &str {
        "recalculation"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn handles(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::RecordUpdated | EventKind::RecordDeleted)
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let depth = event.cascade_depth();
        if depth >= MAX_CASCADE_DEPTH {
            warn!(
                "Cascade depth {} reached at record {}, not recalculating further",
                depth, event.aggregate_id
            );
            return Ok(());
        }
        let Some(service) = self.records.upgrade() else {
            return Ok(());
        };

        let changed = event.changed_fields();
        let options = WriteOptions {
            actor: Some(RECALCULATION_ACTOR.to_string()),
            cascade_depth: depth + 1,
            ..WriteOptions::default()
        };

        for link in self.field_store.find_links_to(&event.table_id).await? {
            let table_fields = self.field_store.find_by_table_id(&link.table_id).await?;
            let roots: Vec<FieldId> = Self::dependents(&table_fields, &link.id, event.kind, &changed)
                .into_iter()
                .map(|f| f.id.clone())
                .collect();

            if roots.is_empty() && event.kind != EventKind::RecordDeleted {
                continue;
            }

            let referencing = self
                .record_store
                .find_referencing(&link.table_id, &link.id, &event.aggregate_id)
                .await?;
            debug!(
                "{} record(s) in {} link to {} via {}",
                referencing.len(),
                link.table_id,
                event.aggregate_id,
                link.id
            );

            for record in referencing {
                if event.kind == EventKind::RecordDeleted {
                    // Dropping the dangling link recomputes its dependents
                    let remaining = without_link(record.get(&link.id), &event.aggregate_id);
                    service
                        .update_record(
                            &link.table_id,
                            &record.id,
                            RecordData::new().with(link.id.clone(), remaining),
                            options.clone(),
                        )
                        .await?;
                } else {
                    service
                        .recalculate_record(&link.table_id, &record.id, &roots, options.clone())
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Link cell value with `record_id` removed
fn without_link(value: Option<&CellValue>, record_id: &str) -> CellValue {
    let remaining: Vec<String> = link_ids(value)
        .into_iter()
        .filter(|id| id != record_id)
        .collect();

    match value {
        _ if remaining.is_empty() => CellValue::Null,
        Some(CellValue::Text(id)) => CellValue::Text(id.clone()),
        _ => CellValue::Links(remaining),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event_id: String,
    pub event_type: String,
    pub table_id: String,
    pub aggregate_id: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

/// Append-only in-memory audit trail
#[derive(Debug, Default)]
pub struct AuditLogHandler {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn name(&self) -> &str {
        "audit-log"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn handles(&self, _kind: EventKind) -> bool {
        true
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        info!(
            event_type = event.event_type(),
            table_id = %event.table_id,
            aggregate_id = %event.aggregate_id,
            actor = %event.actor,
            "audit"
        );
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AuditEntry {
                event_id: event.id.clone(),
                event_type: event.event_type().to_string(),
                table_id: event.table_id.clone(),
                aggregate_id: event.aggregate_id.clone(),
                actor: event.actor.clone(),
                occurred_at: event.occurred_at,
            });
        Ok(())
    }
}
