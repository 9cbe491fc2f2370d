//! In-Memory Store
//!
//! Reference backend implementing every store trait over maps behind a single
//! `tokio::sync::RwLock`. Commit validates all staged writes against the
//! committed state before applying any of them, so a batch lands completely
//! or not at all.
//!
//! A staged record whose expected version no longer matches the stored row
//! lost a race with another unit of work; commit reports that as
//! [`StoreError::Contention`] and the transaction runner retries. The same
//! holds for a field definition change staged against a table whose field
//! revision moved on since it was read.

use super::{FieldStore, RecordStore, SchemaProvider, StagedWrite, StoreError, TransactionProvider};
use crate::calculators::link_ids;
use crate::models::{Field, FieldConfig, FieldId, Record, RecordId};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    fields: HashMap<FieldId, Field>,
    /// Field IDs in creation order
    field_order: Vec<FieldId>,
    /// table ID -> record ID -> record
    records: HashMap<String, HashMap<RecordId, Record>>,
    /// table ID -> physical columns
    columns: HashMap<String, BTreeSet<FieldId>>,
    /// table ID -> number of committed field definition changes
    field_revisions: HashMap<String, u64>,
}

impl MemoryState {
    fn upsert_field(&mut self, field: Field) {
        if !self.fields.contains_key(&field.id) {
            self.field_order.push(field.id.clone());
        }
        self.bump_field_revision(&field.table_id);
        self.fields.insert(field.id.clone(), field);
    }

    fn remove_field(&mut self, field_id: &str) {
        if let Some(field) = self.fields.remove(field_id) {
            self.bump_field_revision(&field.table_id);
        }
        self.field_order.retain(|id| id != field_id);
    }

    fn bump_field_revision(&mut self, table_id: &str) {
        *self.field_revisions.entry(table_id.to_string()).or_default() += 1;
    }

    fn field_revision(&self, table_id: &str) -> u64 {
        self.field_revisions.get(table_id).copied().unwrap_or_default()
    }

    /// ADD COLUMN IF NOT EXISTS: a retried unit of work may provision twice
    fn add_column(&mut self, table_id: &str, field_id: &FieldId) {
        let added = self
            .columns
            .entry(table_id.to_string())
            .or_default()
            .insert(field_id.clone());
        if added {
            tracing::debug!("Added column {} to table {}", field_id, table_id);
        }
    }

    fn record(&self, table_id: &str, record_id: &str) -> Option<&Record> {
        self.records.get(table_id).and_then(|t| t.get(record_id))
    }

    fn check(&self, write: &StagedWrite) -> Result<(), StoreError> {
        match write {
            StagedWrite::SaveRecord {
                record,
                expected_version,
            } => match (expected_version, self.record(&record.table_id, &record.id)) {
                (None, Some(_)) => Err(StoreError::DuplicateKey {
                    entity: "Record",
                    id: record.id.clone(),
                }),
                (Some(expected), Some(current)) if current.version != *expected => {
                    Err(StoreError::contention(format!(
                        "record {} changed concurrently (read v{}, now v{})",
                        record.id, expected, current.version
                    )))
                }
                (Some(_), None) => Err(StoreError::contention(format!(
                    "record {} was deleted concurrently",
                    record.id
                ))),
                _ => Ok(()),
            },
            StagedWrite::DeleteRecord {
                table_id,
                record_id,
                expected_version,
            } => match self.record(table_id, record_id) {
                Some(current) if current.version == *expected_version => Ok(()),
                Some(current) => Err(StoreError::contention(format!(
                    "record {} changed concurrently (read v{}, now v{})",
                    record_id, expected_version, current.version
                ))),
                None => Err(StoreError::contention(format!(
                    "record {} was deleted concurrently",
                    record_id
                ))),
            },
            StagedWrite::AssertFieldRevision { table_id, revision } => {
                let current = self.field_revision(table_id);
                if current == *revision {
                    Ok(())
                } else {
                    Err(StoreError::contention(format!(
                        "fields of table {} changed concurrently (read r{}, now r{})",
                        table_id, revision, current
                    )))
                }
            }
            StagedWrite::SaveField(_)
            | StagedWrite::DeleteField { .. }
            | StagedWrite::SetFieldError { .. }
            | StagedWrite::AddColumn { .. } => Ok(()),
        }
    }

    fn apply(&mut self, write: StagedWrite) {
        match write {
            StagedWrite::SaveRecord { record, .. } => {
                self.records
                    .entry(record.table_id.clone())
                    .or_default()
                    .insert(record.id.clone(), record);
            }
            StagedWrite::DeleteRecord {
                table_id,
                record_id,
                ..
            } => {
                if let Some(table) = self.records.get_mut(&table_id) {
                    table.remove(&record_id);
                }
            }
            StagedWrite::SaveField(field) => self.upsert_field(field),
            StagedWrite::DeleteField { field_id } => self.remove_field(&field_id),
            StagedWrite::SetFieldError {
                field_id,
                has_error,
            } => {
                if let Some(field) = self.fields.get_mut(&field_id) {
                    field.has_error = has_error;
                }
            }
            StagedWrite::AddColumn { table_id, field_id } => self.add_column(&table_id, &field_id),
            StagedWrite::AssertFieldRevision { .. } => {}
        }
    }
}

/// In-memory implementation of all store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    failing_commits: AtomicU32,
    unavailable: AtomicBool,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a contention error
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Simulate an outage: every operation fails with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Committed copy of a record
    pub async fn record(&self, table_id: &str, record_id: &str) -> Option<Record> {
        self.state.read().await.record(table_id, record_id).cloned()
    }

    /// Committed records of a table, in no particular order
    pub async fn records(&self, table_id: &str) -> Vec<Record> {
        self.state
            .read()
            .await
            .records
            .get(table_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Physical columns provisioned for a table
    pub async fn columns(&self, table_id: &str) -> Vec<FieldId> {
        self.state
            .read()
            .await
            .columns
            .get(table_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl FieldStore for MemoryStore {
    async fn find_by_table_id(&self, table_id: &str) -> Result<Vec<Field>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .field_order
            .iter()
            .filter_map(|id| state.fields.get(id))
            .filter(|f| f.table_id == table_id)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, field_id: &str) -> Result<Option<Field>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.fields.get(field_id).cloned())
    }

    async fn table_revision(&self, table_id: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.field_revision(table_id))
    }

    async fn save(&self, field: Field) -> Result<Field, StoreError> {
        self.ensure_available()?;
        self.state.write().await.upsert_field(field.clone());
        Ok(field)
    }

    async fn find_links_to(&self, table_id: &str) -> Result<Vec<Field>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .field_order
            .iter()
            .filter_map(|id| state.fields.get(id))
            .filter(|f| matches!(&f.config, FieldConfig::Link(link) if link.linked_table_id == table_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_record(&self, table_id: &str, record_id: &str) -> Result<Option<Record>, StoreError> {
        self.ensure_available()?;
        Ok(self.record(table_id, record_id).await)
    }

    async fn find_by_ids(&self, table_id: &str, ids: &[RecordId]) -> Result<Vec<Record>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.record(table_id, id).cloned())
            .collect())
    }

    async fn save_record(&self, record: Record) -> Result<Record, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let expected = match state.record(&record.table_id, &record.id) {
            Some(current) if current.version + 1 != record.version => {
                return Err(StoreError::version_conflict(
                    &record.id,
                    record.version - 1,
                    current.version,
                ));
            }
            Some(current) => Some(current.version),
            None => None,
        };
        let write = StagedWrite::SaveRecord {
            record: record.clone(),
            expected_version: expected,
        };
        state.check(&write)?;
        state.apply(write);
        Ok(record)
    }

    async fn find_referencing(
        &self,
        table_id: &str,
        link_field_id: &FieldId,
        record_id: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut matches: Vec<Record> = state
            .records
            .get(table_id)
            .map(|table| {
                table
                    .values()
                    .filter(|r| link_ids(r.get(link_field_id)).iter().any(|id| id == record_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }
}

#[async_trait]
impl TransactionProvider for MemoryStore {
    async fn commit(&self, writes: Vec<StagedWrite>) -> Result<(), StoreError> {
        self.ensure_available()?;

        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::contention("serialization failure (injected)"));
        }

        let mut state = self.state.write().await;
        for write in &writes {
            state.check(write)?;
        }
        for write in writes {
            state.apply(write);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SchemaProvider for MemoryStore {
    async fn add_column(&self, table_id: &str, field_id: &FieldId) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.state.write().await.add_column(table_id, field_id);
        Ok(())
    }

    async fn drop_column(&self, table_id: &str, field_id: &FieldId) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if let Some(columns) = state.columns.get_mut(table_id) {
            columns.remove(field_id);
        }
        tracing::debug!("Dropped column {} from table {}", field_id, table_id);
        Ok(())
    }
}
