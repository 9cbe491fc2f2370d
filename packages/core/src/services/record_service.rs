//! Record Service - Transactional Record Mutations
//!
//! Every mutation is one unit of work:
//!
//! 1. Read the record (staged copy first, then the store)
//! 2. Validate the written cells
//! 3. Apply the mutation and run the calculation orchestrator
//! 4. Stage the record, the field error flags and a domain event
//! 5. Register the real-time broadcast as a post-commit callback
//!
//! The `*_in` variants run against a caller-owned [`TransactionContext`] so
//! several mutations can share one atomic boundary; the plain variants open
//! their own unit of work through the [`TransactionManager`].
//!
//! # Versions
//!
//! A committed mutation bumps the record version by exactly one, however many
//! times the record was touched inside the unit of work. Callers holding a
//! version can pass it as [`WriteOptions::expected_version`]; a mismatch fails
//! with [`StoreError::VersionConflict`] and is not retried.

use crate::calculators::link_ids;
use crate::db::{
    DomainEvent, RecordStore, StoreError, TransactionContext, TransactionManager, TransactionOptions,
};
use crate::models::{CellValue, Field, FieldConfig, FieldId, Record, RecordData, RecordId, ValidationError};
use crate::services::{CalculationOutcome, CalculationService, EngineError, FieldCache, RealtimeNotifier};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Actor recorded when a mutation does not name one
pub const SYSTEM_ACTOR: &str = "system";

/// Per-call options of a record mutation
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Who performs the mutation; defaults to [`SYSTEM_ACTOR`]
    pub actor: Option<String>,

    /// Record ID to create with; generated when absent
    pub record_id: Option<RecordId>,

    /// Reject the mutation unless the stored record has this version
    pub expected_version: Option<i64>,

    /// Overrides the manager's timeout and retry policy
    pub transaction: Option<TransactionOptions>,

    /// Cross-record recalculation hops that led to this mutation
    pub cascade_depth: u32,
}

impl WriteOptions {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }

    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(SYSTEM_ACTOR)
    }
}

#[derive(Clone)]
pub struct RecordService {
    records: Arc<dyn RecordStore>,
    fields: Arc<FieldCache>,
    calculator: Arc<CalculationService>,
    transactions: TransactionManager,
    notifier: Option<Arc<dyn RealtimeNotifier>>,
}

impl RecordService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        calculator: Arc<CalculationService>,
        transactions: TransactionManager,
    ) -> Self {
        Self {
            records,
            fields: calculator.field_cache().clone(),
            calculator,
            transactions,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RealtimeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn get_record(&self, table_id: &str, record_id: &str) -> Result<Option<Record>, EngineError> {
        Ok(self.records.find_record(table_id, record_id).await?)
    }

    /// Create a record and compute every computed field
    #[instrument(skip(self, data, options))]
    pub async fn create_record(
        &self,
        table_id: &str,
        data: RecordData,
        options: WriteOptions,
    ) -> Result<Record, EngineError> {
        let this = self.clone();
        let table_id = table_id.to_string();
        self.transactions
            .run_in_transaction(None, options.transaction, move |tx| {
                let this = this.clone();
                let table_id = table_id.clone();
                let data = data.clone();
                let options = options.clone();
                Box::pin(async move { this.create_record_in(tx, &table_id, data, &options).await })
            })
            .await
    }

    pub async fn create_record_in(
        &self,
        tx: &mut TransactionContext,
        table_id: &str,
        data: RecordData,
        options: &WriteOptions,
    ) -> Result<Record, EngineError> {
        let fields = self.fields.get(table_id).await?;
        validate_writes(table_id, &fields, &data)?;

        let mut record = Record::new(table_id, data, options.actor());
        if let Some(id) = &options.record_id {
            record.id = id.clone();
        }

        let outcome = self.calculator.calculate_all_fields_in(tx, &mut record).await?;
        self.stage_error_states(tx, table_id, &outcome);

        tx.stage_record(record.clone(), None);
        tx.add_event(DomainEvent::record_created(&record).with_cascade_depth(options.cascade_depth));
        self.notify(tx, Broadcast::Created, &record);

        debug!("Staged new record {} in table {}", record.id, table_id);
        Ok(record)
    }

    /// Write `changes` and recompute the fields they affect
    ///
    /// Cells whose value does not change are ignored; if nothing changes the
    /// stored record is returned untouched and no event is emitted.
    #[instrument(skip(self, changes, options))]
    pub async fn update_record(
        &self,
        table_id: &str,
        record_id: &str,
        changes: RecordData,
        options: WriteOptions,
    ) -> Result<Record, EngineError> {
        let this = self.clone();
        let table_id = table_id.to_string();
        let record_id = record_id.to_string();
        self.transactions
            .run_in_transaction(None, options.transaction, move |tx| {
                let this = this.clone();
                let table_id = table_id.clone();
                let record_id = record_id.clone();
                let changes = changes.clone();
                let options = options.clone();
                Box::pin(async move {
                    this.update_record_in(tx, &table_id, &record_id, changes, &options)
                        .await
                })
            })
            .await
    }

    pub async fn update_record_in(
        &self,
        tx: &mut TransactionContext,
        table_id: &str,
        record_id: &str,
        changes: RecordData,
        options: &WriteOptions,
    ) -> Result<Record, EngineError> {
        let current = self.load(tx, table_id, record_id).await?;
        check_expected_version(&current, options)?;

        let fields = self.fields.get(table_id).await?;
        validate_writes(table_id, &fields, &changes)?;

        let written: Vec<FieldId> = changes
            .iter()
            .filter(|(id, value)| current.get(id).unwrap_or(&CellValue::Null) != *value)
            .map(|(id, _)| id.clone())
            .collect();
        if written.is_empty() {
            debug!("Update of record {} changes nothing", record_id);
            return Ok(current);
        }

        let mut record = current.clone();
        for (field_id, value) in changes {
            record.data.insert(field_id, value);
        }

        let outcome = self
            .calculator
            .calculate_affected_fields_in(tx, &mut record, &written)
            .await?;
        self.stage_error_states(tx, table_id, &outcome);

        let changed = changed_fields(&current, &record);
        self.stage_update(tx, &current, record, &changed, options)
    }

    /// Delete a record; returns its last committed state
    #[instrument(skip(self, options))]
    pub async fn delete_record(
        &self,
        table_id: &str,
        record_id: &str,
        options: WriteOptions,
    ) -> Result<Record, EngineError> {
        let this = self.clone();
        let table_id = table_id.to_string();
        let record_id = record_id.to_string();
        self.transactions
            .run_in_transaction(None, options.transaction, move |tx| {
                let this = this.clone();
                let table_id = table_id.clone();
                let record_id = record_id.clone();
                let options = options.clone();
                Box::pin(async move { this.delete_record_in(tx, &table_id, &record_id, &options).await })
            })
            .await
    }

    pub async fn delete_record_in(
        &self,
        tx: &mut TransactionContext,
        table_id: &str,
        record_id: &str,
        options: &WriteOptions,
    ) -> Result<Record, EngineError> {
        let current = self.load(tx, table_id, record_id).await?;
        check_expected_version(&current, options)?;

        let expected = match tx.staged_expected_version(table_id, record_id) {
            Some(Some(read_at)) => read_at,
            _ => current.version,
        };
        let inserted_here = tx.is_staged_insert(table_id, record_id);
        tx.stage_delete(table_id, record_id, expected);
        tx.add_event(
            DomainEvent::record_deleted(&current, options.actor()).with_cascade_depth(options.cascade_depth),
        );
        if inserted_here {
            // Never visible outside this unit of work
            tx.cancel_on_commit(&broadcast_key(&current));
        } else {
            self.notify(tx, Broadcast::Deleted, &current);
        }

        debug!("Staged deletion of record {} in table {}", record_id, table_id);
        Ok(current)
    }

    /// Recompute `roots` (and their dependents) for a record whose inputs live elsewhere
    ///
    /// Returns the persisted record, or `None` when the record no longer
    /// exists or nothing changed.
    #[instrument(skip(self, options))]
    pub async fn recalculate_record(
        &self,
        table_id: &str,
        record_id: &str,
        roots: &[FieldId],
        options: WriteOptions,
    ) -> Result<Option<Record>, EngineError> {
        let this = self.clone();
        let table_id = table_id.to_string();
        let record_id = record_id.to_string();
        let roots = roots.to_vec();
        self.transactions
            .run_in_transaction(None, options.transaction, move |tx| {
                let this = this.clone();
                let table_id = table_id.clone();
                let record_id = record_id.clone();
                let roots = roots.clone();
                let options = options.clone();
                Box::pin(async move {
                    this.recalculate_record_in(tx, &table_id, &record_id, &roots, &options)
                        .await
                })
            })
            .await
    }

    pub async fn recalculate_record_in(
        &self,
        tx: &mut TransactionContext,
        table_id: &str,
        record_id: &str,
        roots: &[FieldId],
        options: &WriteOptions,
    ) -> Result<Option<Record>, EngineError> {
        let current = match self.load(tx, table_id, record_id).await {
            Ok(record) => record,
            Err(EngineError::RecordNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut record = current.clone();
        let outcome = self.calculator.calculate_fields_from_in(tx, &mut record, roots).await?;
        self.stage_error_states(tx, table_id, &outcome);

        let changed = changed_fields(&current, &record);
        if changed.is_empty() {
            return Ok(None);
        }
        self.stage_update(tx, &current, record, &changed, options).map(Some)
    }

    async fn load(&self, tx: &TransactionContext, table_id: &str, record_id: &str) -> Result<Record, EngineError> {
        if tx.is_deleted(table_id, record_id) {
            return Err(EngineError::record_not_found(record_id));
        }
        if let Some(staged) = tx.staged_record(table_id, record_id) {
            return Ok(staged.clone());
        }
        self.records
            .find_record(table_id, record_id)
            .await?
            .ok_or_else(|| EngineError::record_not_found(record_id))
    }

    fn stage_update(
        &self,
        tx: &mut TransactionContext,
        current: &Record,
        mut record: Record,
        changed: &[FieldId],
        options: &WriteOptions,
    ) -> Result<Record, EngineError> {
        record.touch(options.actor());
        // A record already staged in this unit of work keeps its single bump
        if let Some(read_at) = tx.staged_expected_version(&record.table_id, &record.id) {
            record.version = read_at.map_or(1, |v| v + 1);
        }

        tx.stage_record(record.clone(), Some(current.version));
        tx.add_event(DomainEvent::record_updated(&record, changed).with_cascade_depth(options.cascade_depth));
        self.notify(tx, Broadcast::Updated, &record);
        Ok(record)
    }

    fn stage_error_states(&self, tx: &mut TransactionContext, table_id: &str, outcome: &CalculationOutcome) {
        if outcome.error_state_changes.is_empty() {
            return;
        }
        for (field_id, has_error) in &outcome.error_state_changes {
            tx.stage_field_error(field_id, *has_error);
        }

        // Cached definitions carry the old flags
        let cache = self.fields.clone();
        let table_id = table_id.to_string();
        tx.on_commit_keyed(format!("field-cache:{}", table_id), move || async move {
            cache.invalidate(&table_id).await;
        });
    }

    /// Register the record's single post-commit broadcast
    ///
    /// A later call for the same record replaces the earlier one. An update of
    /// a record inserted in this unit of work is still announced as a creation.
    fn notify(&self, tx: &mut TransactionContext, kind: Broadcast, record: &Record) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let kind = match kind {
            Broadcast::Updated if tx.is_staged_insert(&record.table_id, &record.id) => Broadcast::Created,
            kind => kind,
        };

        let table_id = record.table_id.clone();
        let record_id = record.id.clone();
        let fields = record.data.to_json_map();
        tx.on_commit_keyed(broadcast_key(record), move || async move {
            let result = match kind {
                Broadcast::Created => notifier.broadcast_record_created(&table_id, &record_id, fields).await,
                Broadcast::Updated => notifier.broadcast_record_updated(&table_id, &record_id, fields).await,
                Broadcast::Deleted => notifier.broadcast_record_deleted(&table_id, &record_id).await,
            };
            if let Err(e) = result {
                warn!("Real-time broadcast for record {} failed: {:#}", record_id, e);
            }
        });
    }
}

impl std::fmt::Debug for RecordService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordService")
            .field("calculator", &self.calculator)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Broadcast {
    Created,
    Updated,
    Deleted,
}

fn broadcast_key(record: &Record) -> String {
    format!("broadcast:{}:{}", record.table_id, record.id)
}

fn check_expected_version(current: &Record, options: &WriteOptions) -> Result<(), EngineError> {
    match options.expected_version {
        Some(expected) if expected != current.version => {
            Err(StoreError::version_conflict(&current.id, expected, current.version).into())
        }
        _ => Ok(()),
    }
}

/// Field IDs whose value differs between two versions of a record
fn changed_fields(before: &Record, after: &Record) -> Vec<FieldId> {
    let mut changed: Vec<FieldId> = after
        .data
        .iter()
        .filter(|(id, value)| before.get(id) != Some(*value))
        .map(|(id, _)| id.clone())
        .collect();
    for id in before.data.keys() {
        if !after.data.contains(id) {
            changed.push(id.clone());
        }
    }
    changed
}

/// Reject writes to unknown or computed fields and values of the wrong shape
fn validate_writes(table_id: &str, fields: &[Field], data: &RecordData) -> Result<(), ValidationError> {
    let by_id: HashMap<&str, &Field> = fields.iter().map(|f| (f.id.as_str(), f)).collect();

    for (field_id, value) in data.iter() {
        let field = by_id.get(field_id.as_str()).ok_or_else(|| ValidationError::UnknownField {
            field: field_id.clone(),
            table_id: table_id.to_string(),
        })?;
        if field.is_computed() {
            return Err(ValidationError::ComputedFieldWrite {
                field: field.name.clone(),
            });
        }
        validate_value(field, value)?;
    }
    Ok(())
}

fn validate_value(field: &Field, value: &CellValue) -> Result<(), ValidationError> {
    let mismatch = |expected: &str| Err(ValidationError::invalid_value(&field.name, format!("expected {}", expected)));

    match (&field.config, value) {
        (_, CellValue::Null) => Ok(()),
        (_, CellValue::Unset) => mismatch("a value"),
        (FieldConfig::Number(_), CellValue::Number(_)) => Ok(()),
        (FieldConfig::Number(_), _) => mismatch("a number"),
        (FieldConfig::Checkbox, CellValue::Bool(_)) => Ok(()),
        (FieldConfig::Checkbox, _) => mismatch("a boolean"),
        (FieldConfig::Select(select), CellValue::Text(choice)) => {
            if select.choices.is_empty() || select.choices.contains(choice) {
                Ok(())
            } else {
                Err(ValidationError::invalid_value(
                    &field.name,
                    format!("'{}' is not one of the choices", choice),
                ))
            }
        }
        (FieldConfig::Select(_), _) => mismatch("a choice"),
        (FieldConfig::Link(link), CellValue::Links(_) | CellValue::Text(_) | CellValue::List(_)) => {
            let ids = link_ids(Some(value));
            if !link.multiple && ids.len() > 1 {
                return Err(ValidationError::invalid_value(&field.name, "only one linked record allowed"));
            }
            Ok(())
        }
        (FieldConfig::Link(_), _) => mismatch("linked record IDs"),
        (FieldConfig::Text | FieldConfig::LongText | FieldConfig::Date, CellValue::Text(_)) => Ok(()),
        (FieldConfig::Text | FieldConfig::LongText | FieldConfig::Date, _) => mismatch("text"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FieldStore, MemoryStore};
    use crate::expression::FormulaEngine;
    use crate::models::{FormulaConfig, LinkConfig, SelectConfig};
    use crate::services::{BroadcastNotifier, RealtimeAction};
    use std::time::Duration;

    fn formula(id: &str, name: &str, expression: &str) -> Field {
        Field::with_id(
            id,
            "t1",
            name,
            FieldConfig::Formula(FormulaConfig {
                expression: expression.to_string(),
                timezone: None,
            }),
        )
    }

    fn number(id: &str, name: &str) -> Field {
        Field::with_id(id, "t1", name, FieldConfig::Number(Default::default()))
    }

    async fn setup(fields: Vec<Field>) -> (Arc<MemoryStore>, RecordService, BroadcastNotifier) {
        let store = Arc::new(MemoryStore::new());
        for field in fields {
            store.save(field).await.unwrap();
        }
        let cache = Arc::new(FieldCache::new(store.clone()));
        let calculator = Arc::new(CalculationService::new(cache, store.clone(), Arc::new(FormulaEngine::new())));
        let transactions = TransactionManager::new(store.clone(), TransactionOptions::default());
        let notifier = BroadcastNotifier::new();
        let service = RecordService::new(store.clone(), calculator, transactions)
            .with_notifier(Arc::new(notifier.clone()));
        (store, service, notifier)
    }

    fn abcd() -> Vec<Field> {
        vec![
            number("a", "A"),
            formula("b", "B", "{A} * 2"),
            formula("c", "C", "{B} + 1"),
            number("d", "D"),
        ]
    }

    #[tokio::test]
    async fn test_create_then_update_recomputes() {
        let (store, service, _) = setup(abcd()).await;

        let created = service
            .create_record("t1", RecordData::new().with("a", 5.0).with("d", 1.0), WriteOptions::by("alice"))
            .await
            .unwrap();
        assert_eq!(created.get("b"), Some(&CellValue::Number(10.0)));
        assert_eq!(created.get("c"), Some(&CellValue::Number(11.0)));
        assert_eq!(created.version, 1);

        let updated = service
            .update_record("t1", &created.id, RecordData::new().with("a", 10.0), WriteOptions::by("bob"))
            .await
            .unwrap();
        assert_eq!(updated.get("b"), Some(&CellValue::Number(20.0)));
        assert_eq!(updated.get("c"), Some(&CellValue::Number(21.0)));
        assert_eq!(updated.get("d"), Some(&CellValue::Number(1.0)));
        assert_eq!(updated.version, 2);
        assert_eq!(updated.modified_by, "bob");

        assert_eq!(store.record("t1", &created.id).await, Some(updated));
    }

    #[tokio::test]
    async fn test_computed_and_unknown_writes_rejected() {
        let (store, service, _) = setup(abcd()).await;

        let err = service
            .create_record("t1", RecordData::new().with("b", 1.0), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::ComputedFieldWrite { .. })));

        let err = service
            .create_record("t1", RecordData::new().with("zzz", 1.0), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::UnknownField { .. })));

        let err = service
            .create_record("t1", RecordData::new().with("a", "five"), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.records("t1").await.is_empty());
    }

    #[tokio::test]
    async fn test_expected_version_mismatch() {
        let (_, service, _) = setup(abcd()).await;
        let created = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();

        let err = service
            .update_record(
                "t1",
                &created.id,
                RecordData::new().with("a", 2.0),
                WriteOptions::default().with_expected_version(7),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::VersionConflict { .. })));

        let ok = service
            .update_record(
                "t1",
                &created.id,
                RecordData::new().with("a", 2.0),
                WriteOptions::default().with_expected_version(1),
            )
            .await
            .unwrap();
        assert_eq!(ok.version, 2);
    }

    #[tokio::test]
    async fn test_noop_update_keeps_version_and_skips_broadcast() {
        let (_, service, notifier) = setup(abcd()).await;
        let created = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        let mut rx = notifier.subscribe();

        let same = service
            .update_record("t1", &created.id, RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(same.version, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_updates_in_one_unit_of_work() {
        let (store, service, notifier) = setup(abcd()).await;
        let created = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        let mut rx = notifier.subscribe();

        let id = created.id.clone();
        let inner = service.clone();
        let last = service
            .transactions
            .run_in_transaction(None, None, move |tx| {
                let service = inner.clone();
                let id = id.clone();
                Box::pin(async move {
                    let options = WriteOptions::default();
                    for a in [2.0, 3.0, 4.0] {
                        service
                            .update_record_in(tx, "t1", &id, RecordData::new().with("a", a), &options)
                            .await?;
                    }
                    service.load(tx, "t1", &id).await
                })
            })
            .await
            .unwrap();

        assert_eq!(last.version, 2);
        assert_eq!(last.get("c"), Some(&CellValue::Number(9.0)));
        assert_eq!(store.record("t1", &created.id).await.unwrap().version, 2);

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.action, RealtimeAction::RecordUpdated);
        assert_eq!(message.fields["a"], 4.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_record() {
        let (store, service, notifier) = setup(abcd()).await;
        let created = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        let mut rx = notifier.subscribe();

        let deleted = service
            .delete_record("t1", &created.id, WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(deleted.id, created.id);
        assert!(store.record("t1", &created.id).await.is_none());

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.action, RealtimeAction::RecordDeleted);

        let err = service
            .delete_record("t1", &created.id, WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::record_not_found(&created.id));
    }

    #[tokio::test]
    async fn test_mutation_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_, service, _) = setup(abcd()).await;

        let update = service.update_record("t1", "r1", RecordData::new().with("a", 1.0), WriteOptions::default());
        assert_send(&update);
        let delete = service.delete_record("t1", "r1", WriteOptions::default());
        assert_send(&delete);
        let recalculate = service.recalculate_record("t1", "r1", &[], WriteOptions::default());
        assert_send(&recalculate);
    }

    async fn in_one_unit_of_work(service: &RecordService, steps: &'static [&'static str]) -> Record {
        let inner = service.clone();
        service
            .transactions
            .run_in_transaction(None, None, move |tx| {
                let service = inner.clone();
                Box::pin(async move {
                    let options = WriteOptions::default();
                    let mut record = service
                        .create_record_in(tx, "t1", RecordData::new().with("a", 1.0), &options)
                        .await?;
                    for step in steps {
                        record = match *step {
                            "update" => {
                                service
                                    .update_record_in(tx, "t1", &record.id, RecordData::new().with("a", 5.0), &options)
                                    .await?
                            }
                            _ => service.delete_record_in(tx, "t1", &record.id, &options).await?,
                        };
                    }
                    Ok(record)
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_created_then_updated_broadcasts_one_creation() {
        let (_, service, notifier) = setup(abcd()).await;
        let mut rx = notifier.subscribe();

        let record = in_one_unit_of_work(&service, &["update"]).await;

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.action, RealtimeAction::RecordCreated);
        assert_eq!(message.record_id, record.id);
        assert_eq!(message.fields["a"], 5.0);
        assert_eq!(message.fields["b"], 10.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_created_then_deleted_broadcasts_nothing() {
        let (store, service, notifier) = setup(abcd()).await;
        let mut rx = notifier.subscribe();

        let record = in_one_unit_of_work(&service, &["update", "delete"]).await;

        assert!(store.record("t1", &record.id).await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_updated_then_deleted_broadcasts_one_deletion() {
        let (store, service, notifier) = setup(abcd()).await;
        let created = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        let mut rx = notifier.subscribe();

        let id = created.id.clone();
        let inner = service.clone();
        service
            .transactions
            .run_in_transaction(None, None, move |tx| {
                let service = inner.clone();
                let id = id.clone();
                Box::pin(async move {
                    let options = WriteOptions::default();
                    service
                        .update_record_in(tx, "t1", &id, RecordData::new().with("a", 2.0), &options)
                        .await?;
                    service.delete_record_in(tx, "t1", &id, &options).await
                })
            })
            .await
            .unwrap();

        assert!(store.record("t1", &created.id).await.is_none());
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.action, RealtimeAction::RecordDeleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_field_flags_error_state() {
        let fields = vec![number("a", "A"), formula("bad", "Bad", "{A} / 0")];
        let (store, service, _) = setup(fields).await;

        let record = service
            .create_record("t1", RecordData::new().with("a", 1.0), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(record.get("bad"), Some(&CellValue::Unset));
        assert!(store.find_by_id("bad").await.unwrap().unwrap().has_error);

        service
            .update_record("t1", &record.id, RecordData::new().with("a", 0.0), WriteOptions::default())
            .await
            .unwrap();
        assert!(store.find_by_id("bad").await.unwrap().unwrap().has_error);
    }

    #[test]
    fn test_validate_value_shapes() {
        let select = Field::with_id(
            "s",
            "t1",
            "Status",
            FieldConfig::Select(SelectConfig {
                choices: vec!["open".into(), "done".into()],
            }),
        );
        assert!(validate_value(&select, &CellValue::Text("open".into())).is_ok());
        assert!(validate_value(&select, &CellValue::Text("maybe".into())).is_err());

        let single = Field::with_id(
            "l",
            "t1",
            "Owner",
            FieldConfig::Link(LinkConfig {
                linked_table_id: "people".into(),
                multiple: false,
            }),
        );
        assert!(validate_value(&single, &CellValue::Links(vec!["p1".into()])).is_ok());
        assert!(validate_value(&single, &CellValue::Links(vec!["p1".into(), "p2".into()])).is_err());
        assert!(validate_value(&single, &CellValue::Number(1.0)).is_err());
        assert!(validate_value(&single, &CellValue::Null).is_ok());
    }
}
