//! Calculation Orchestrator
//!
//! Recomputes the computed fields of one record:
//!
//! ```text
//! fetch fields -> filter computed -> build graph -> detect cycle
//!              -> order -> prefetch linked records -> dispatch -> merge
//! ```
//!
//! Ordering depends on the entry point. Record creation evaluates every
//! computed field ([`CalculationService::calculate_all_fields`]); record updates
//! only evaluate the closure of fields affected by the changed ones
//! ([`CalculationService::calculate_affected_fields`]).
//!
//! # Dispatch
//!
//! The ordered fields are grouped into evaluation levels. Fields of one level
//! have no edges between them and may run on the [`WorkerPool`]; a level is
//! merged into the record before the next one starts, so a field never sees a
//! stale dependency.
//!
//! # Failures
//!
//! A calculator error only affects its own field: the cell becomes
//! [`CellValue::Unset`], the failure is reported on the [`CalculationOutcome`]
//! and the field's error flag is scheduled to flip. Store failures, cycles and
//! task panics abort the whole calculation.
//!
//! The orchestrator never persists. Callers stage the mutated record and the
//! error-state changes inside their unit of work.

use crate::calculators::{link_ids, CalculationContext, CalculationError, CalculatorRegistry, LinkedRecords};
use crate::db::{RecordStore, TransactionContext};
use crate::expression::ExpressionEvaluator;
use crate::graph::{DependencyGraph, GraphError};
use crate::models::{CellValue, Field, FieldConfig, FieldId, Record, RecordId};
use crate::operations::{CancellationSignal, PoolError, WorkerPool};
use crate::services::{EngineError, FieldCache};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A computed field whose calculator failed
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFailure {
    pub field_id: FieldId,
    pub message: String,
}

/// What one orchestrator run did to a record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculationOutcome {
    /// Evaluated fields, in evaluation order
    pub computed: Vec<FieldId>,

    pub failures: Vec<FieldFailure>,

    /// Fields whose error flag must flip, with the new flag
    pub error_state_changes: Vec<(FieldId, bool)>,
}

impl CalculationOutcome {
    /// Nothing was evaluated
    pub fn is_noop(&self) -> bool {
        self.computed.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum Plan<'a> {
    All,
    Affected(&'a [FieldId]),
    From(&'a [FieldId]),
}

type FieldResult = (FieldId, Result<CellValue, CalculationError>);

pub struct CalculationService {
    fields: Arc<FieldCache>,
    records: Arc<dyn RecordStore>,
    calculators: Arc<CalculatorRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    pool: WorkerPool,
    parallel_threshold: usize,
    timezone: String,
    dispatch_timeout: Option<Duration>,
}

impl CalculationService {
    pub fn new(
        fields: Arc<FieldCache>,
        records: Arc<dyn RecordStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            fields,
            records,
            calculators: Arc::new(CalculatorRegistry::with_defaults(evaluator.clone())),
            evaluator,
            pool: WorkerPool::default(),
            parallel_threshold: 2,
            timezone: "UTC".to_string(),
            dispatch_timeout: None,
        }
    }

    /// Replace the default calculators
    pub fn with_calculators(mut self, calculators: CalculatorRegistry) -> Self {
        self.calculators = Arc::new(calculators);
        self
    }

    /// Fan levels of at least `parallel_threshold` fields out to `pool`
    pub fn with_pool(mut self, pool: WorkerPool, parallel_threshold: usize) -> Self {
        self.pool = pool;
        self.parallel_threshold = parallel_threshold.max(2);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Abandon a pooled level that runs longer than `timeout`
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    pub fn field_cache(&self) -> &Arc<FieldCache> {
        &self.fields
    }

    /// Evaluate every computed field of the record (record creation)
    #[instrument(skip(self, record), fields(table_id = %record.table_id, record_id = %record.id))]
    pub async fn calculate_all_fields(&self, record: &mut Record) -> Result<CalculationOutcome, EngineError> {
        self.run(None, record, Plan::All).await
    }

    /// Evaluate the computed fields reachable from `changed` (record update)
    #[instrument(skip(self, record), fields(table_id = %record.table_id, record_id = %record.id))]
    pub async fn calculate_affected_fields(
        &self,
        record: &mut Record,
        changed: &[FieldId],
    ) -> Result<CalculationOutcome, EngineError> {
        self.run(None, record, Plan::Affected(changed)).await
    }

    /// Evaluate `roots` themselves plus everything downstream of them
    ///
    /// Used when a computed field's inputs live in another record, so no
    /// field of this record changed.
    #[instrument(skip(self, record), fields(table_id = %record.table_id, record_id = %record.id))]
    pub async fn calculate_fields_from(
        &self,
        record: &mut Record,
        roots: &[FieldId],
    ) -> Result<CalculationOutcome, EngineError> {
        self.run(None, record, Plan::From(roots)).await
    }

    /// [`calculate_all_fields`](Self::calculate_all_fields) reading linked
    /// records through the writes staged on `tx`
    pub async fn calculate_all_fields_in(
        &self,
        tx: &TransactionContext,
        record: &mut Record,
    ) -> Result<CalculationOutcome, EngineError> {
        self.run(Some(tx), record, Plan::All).await
    }

    pub async fn calculate_affected_fields_in(
        &self,
        tx: &TransactionContext,
        record: &mut Record,
        changed: &[FieldId],
    ) -> Result<CalculationOutcome, EngineError> {
        self.run(Some(tx), record, Plan::Affected(changed)).await
    }

    pub async fn calculate_fields_from_in(
        &self,
        tx: &TransactionContext,
        record: &mut Record,
        roots: &[FieldId],
    ) -> Result<CalculationOutcome, EngineError> {
        self.run(Some(tx), record, Plan::From(roots)).await
    }

    async fn run(
        &self,
        tx: Option<&TransactionContext>,
        record: &mut Record,
        plan: Plan<'_>,
    ) -> Result<CalculationOutcome, EngineError> {
        let fields = self.fields.get(&record.table_id).await?;
        if !fields.iter().any(Field::is_computed) {
            return Ok(CalculationOutcome::default());
        }

        let graph = DependencyGraph::build_with(&fields, Some(self.evaluator.as_ref()));
        if let Some(cycle) = graph.detect_cycle() {
            warn!("Refusing to calculate table {}: cycle {:?}", record.table_id, cycle);
            return Err(GraphError::CycleDetected { fields: cycle }.into());
        }

        let ordered = match plan {
            Plan::All => graph.topological_sort()?,
            Plan::Affected(changed) => graph.affected_fields(changed)?,
            Plan::From(roots) => graph.closure_of(roots)?,
        };
        if ordered.is_empty() {
            debug!("No computed fields affected");
            return Ok(CalculationOutcome::default());
        }

        let by_id: HashMap<FieldId, Field> = fields.iter().map(|f| (f.id.clone(), f.clone())).collect();
        let linked = self.prefetch_linked(tx, record, &ordered, &by_id).await?;
        let levels = graph.evaluation_levels(&ordered);
        debug!("Evaluating {} field(s) in {} level(s)", ordered.len(), levels.len());

        self.dispatch(record, levels, Arc::new(by_id), Arc::new(linked)).await
    }

    /// Batch-fetch the records linked through every rollup/lookup in `ordered`
    ///
    /// Records staged on `tx` shadow their stored copies; records deleted on
    /// `tx` are skipped.
    async fn prefetch_linked(
        &self,
        tx: Option<&TransactionContext>,
        record: &Record,
        ordered: &[FieldId],
        fields: &HashMap<FieldId, Field>,
    ) -> Result<LinkedRecords, EngineError> {
        let mut wanted: HashMap<&str, Vec<RecordId>> = HashMap::new();

        for field_id in ordered {
            let Some(field) = fields.get(field_id) else { continue };
            if !matches!(field.config, FieldConfig::Rollup(_) | FieldConfig::Lookup(_)) {
                continue;
            }
            let Some(link_field_id) = field.config.link_field_id() else { continue };
            let Some(FieldConfig::Link(link)) = fields.get(link_field_id).map(|f| &f.config) else {
                continue;
            };

            let ids = wanted.entry(link.linked_table_id.as_str()).or_default();
            for id in link_ids(record.get(link_field_id)) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        let mut linked = LinkedRecords::new();
        for (table_id, mut ids) in wanted {
            if let Some(tx) = tx {
                ids.retain(|id| {
                    if tx.is_deleted(table_id, id) {
                        return false;
                    }
                    match tx.staged_record(table_id, id) {
                        Some(staged) => {
                            linked.insert(staged.clone());
                            false
                        }
                        None => true,
                    }
                });
            }
            if ids.is_empty() {
                continue;
            }
            let found = self.records.find_by_ids(table_id, &ids).await?;
            debug!("Prefetched {}/{} linked record(s) from {}", found.len(), ids.len(), table_id);
            for linked_record in found {
                linked.insert(linked_record);
            }
        }
        Ok(linked)
    }

    async fn dispatch(
        &self,
        record: &mut Record,
        levels: Vec<Vec<FieldId>>,
        fields: Arc<HashMap<FieldId, Field>>,
        linked: Arc<LinkedRecords>,
    ) -> Result<CalculationOutcome, EngineError> {
        let mut outcome = CalculationOutcome::default();
        let cancel = CancellationSignal::new();

        for level in levels {
            let results = if level.len() >= self.parallel_threshold {
                self.run_pooled(record, level, &fields, &linked, &cancel).await?
            } else {
                let ctx = CalculationContext {
                    record,
                    fields: &fields,
                    linked: &linked,
                    timezone: &self.timezone,
                };
                level
                    .into_iter()
                    .filter_map(|id| {
                        let field = fields.get(&id)?;
                        let result = self.calculators.calculate(field, &ctx);
                        Some((id, result))
                    })
                    .collect()
            };

            for (field_id, result) in results {
                self.merge(record, &fields, field_id, result, &mut outcome);
            }
        }

        Ok(outcome)
    }

    async fn run_pooled(
        &self,
        record: &Record,
        level: Vec<FieldId>,
        fields: &Arc<HashMap<FieldId, Field>>,
        linked: &Arc<LinkedRecords>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<FieldResult>, EngineError> {
        let snapshot = Arc::new(record.clone());
        let timezone: Arc<str> = Arc::from(self.timezone.as_str());

        let jobs: Vec<_> = level
            .into_iter()
            .map(|field_id| {
                let calculators = self.calculators.clone();
                let fields = fields.clone();
                let linked = linked.clone();
                let record = snapshot.clone();
                let timezone = timezone.clone();
                move || async move {
                    let ctx = CalculationContext {
                        record: &record,
                        fields: &fields,
                        linked: &linked,
                        timezone: &timezone,
                    };
                    let result = match fields.get(&field_id) {
                        Some(field) => calculators.calculate(field, &ctx),
                        None => Ok(CellValue::Null),
                    };
                    (field_id, result)
                }
            })
            .collect();

        let deadline = self
            .dispatch_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        self.pool
            .run_all(jobs, cancel, deadline)
            .await
            .map_err(|e| match e {
                PoolError::Cancelled | PoolError::DeadlineExceeded => EngineError::cancelled(e.to_string()),
                PoolError::TaskFailed(msg) => EngineError::infrastructure(format!("calculator task failed: {}", msg)),
            })
    }

    fn merge(
        &self,
        record: &mut Record,
        fields: &HashMap<FieldId, Field>,
        field_id: FieldId,
        result: Result<CellValue, CalculationError>,
        outcome: &mut CalculationOutcome,
    ) {
        let failed = result.is_err();
        match result {
            Ok(value) => {
                record.data.insert(field_id.clone(), value);
            }
            Err(e) => {
                warn!("Calculation of field {} failed for record {}: {}", field_id, record.id, e);
                record.data.insert(field_id.clone(), CellValue::Unset);
                outcome.failures.push(FieldFailure {
                    field_id: field_id.clone(),
                    message: e.to_string(),
                });
            }
        }

        if fields.get(&field_id).is_some_and(|f| f.has_error != failed) {
            outcome.error_state_changes.push((field_id.clone(), failed));
        }
        outcome.computed.push(field_id);
    }
}

impl std::fmt::Debug for CalculationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationService")
            .field("pool_size", &self.pool.size())
            .field("parallel_threshold", &self.parallel_threshold)
            .field("timezone", &self.timezone)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::Calculator;
    use crate::db::{FieldStore, MemoryStore};
    use crate::expression::FormulaEngine;
    use crate::models::{
        FieldType, FormulaConfig, LinkConfig, LookupConfig, RecordData, RollupConfig,
    };

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

    async fn service_with(fields: Vec<Field>) -> (Arc<MemoryStore>, CalculationService) {
        let store = Arc::new(MemoryStore::new());
        for field in fields {
            store.save(field).await.unwrap();
        }
        let cache = Arc::new(FieldCache::new(store.clone()));
        let service = CalculationService::new(cache, store.clone(), Arc::new(FormulaEngine::new()));
        (store, service)
    }

    fn abcd_fields() -> Vec<Field> {
        vec![
            number("a", "A"),
            formula("b", "B", "{A} * 2"),
            formula("c", "C", "{B} + 1"),
            number("d", "D"),
        ]
    }

    #[tokio::test]
    async fn test_calculate_all_fields_chain() {
        let (_, service) = service_with(abcd_fields()).await;
        let mut record = Record::new("t1", RecordData::new().with("a", 5.0).with("d", 99.0), "alice");

        let outcome = service.calculate_all_fields(&mut record).await.unwrap();
        assert_eq!(outcome.computed, vec!["b", "c"]);
        assert_eq!(record.get("b"), Some(&CellValue::Number(10.0)));
        assert_eq!(record.get("c"), Some(&CellValue::Number(11.0)));
        assert_eq!(record.get("d"), Some(&CellValue::Number(99.0)));
    }

    #[tokio::test]
    async fn test_affected_fields_only() {
        let (_, service) = service_with(abcd_fields()).await;
        let mut record = Record::new(
            "t1",
            RecordData::new().with("a", 10.0).with("b", 10.0).with("c", 11.0),
            "alice",
        );

        let outcome = service
            .calculate_affected_fields(&mut record, &["d".to_string()])
            .await
            .unwrap();
        assert!(outcome.is_noop());
        assert_eq!(record.get("b"), Some(&CellValue::Number(10.0)));

        let outcome = service
            .calculate_affected_fields(&mut record, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.computed, vec!["b", "c"]);
        assert_eq!(record.get("c"), Some(&CellValue::Number(21.0)));
    }

    #[tokio::test]
    async fn test_no_computed_fields_is_noop() {
        let (_, service) = service_with(vec![number("a", "A")]).await;
        let mut record = Record::new("t1", RecordData::new().with("a", 1.0), "alice");
        let before = record.clone();

        let outcome = service.calculate_all_fields(&mut record).await.unwrap();
        assert!(outcome.is_noop());
        assert_eq!(record, before);
    }

    #[tokio::test]
    async fn test_cycle_aborts() {
        let (_, service) = service_with(vec![formula("x", "X", "{Y}"), formula("y", "Y", "{X}")]).await;
        let mut record = Record::new("t1", RecordData::new(), "alice");

        let err = service.calculate_all_fields(&mut record).await.unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::CycleDetected { .. })));
        assert!(record.data.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_field() {
        let fields = vec![
            number("a", "A"),
            formula("ok1", "Ok1", "{A} + 1"),
            formula("bad", "Bad", "{A} / 0"),
            formula("ok2", "Ok2", "{A} * 3"),
        ];
        let (_, service) = service_with(fields).await;
        let mut record = Record::new("t1", RecordData::new().with("a", 2.0), "alice");

        let outcome = service.calculate_all_fields(&mut record).await.unwrap();
        assert_eq!(record.get("ok1"), Some(&CellValue::Number(3.0)));
        assert_eq!(record.get("ok2"), Some(&CellValue::Number(6.0)));
        assert_eq!(record.get("bad"), Some(&CellValue::Unset));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].field_id, "bad");
        assert_eq!(outcome.error_state_changes, vec![("bad".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_recovered_field_clears_error_flag() {
        let mut flagged = formula("b", "B", "{A} * 2");
        flagged.has_error = true;
        let (_, service) = service_with(vec![number("a", "A"), flagged]).await;
        let mut record = Record::new("t1", RecordData::new().with("a", 1.0), "alice");

        let outcome = service.calculate_all_fields(&mut record).await.unwrap();
        assert_eq!(outcome.error_state_changes, vec![("b".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_full_recompute_is_idempotent() {
        let (_, service) = service_with(abcd_fields()).await;
        let mut record = Record::new("t1", RecordData::new().with("a", 7.0), "alice");

        service.calculate_all_fields(&mut record).await.unwrap();
        let first = record.data.clone();
        service.calculate_all_fields(&mut record).await.unwrap();
        assert_eq!(record.data, first);
    }

    #[tokio::test]
    async fn test_pooled_level_matches_sequential() {
        let fields: Vec<Field> = std::iter::once(number("a", "A"))
            .chain((0..6).map(|i| formula(&format!("f{}", i), &format!("F{}", i), &format!("{{A}} + {}", i))))
            .collect();
        let (store, _) = service_with(fields).await;
        let cache = Arc::new(FieldCache::new(store.clone()));
        let service = CalculationService::new(cache, store.clone(), Arc::new(FormulaEngine::new()))
            .with_pool(WorkerPool::new(3), 2);

        let mut record = Record::new("t1", RecordData::new().with("a", 1.0), "alice");
        let outcome = service.calculate_all_fields(&mut record).await.unwrap();

        assert_eq!(outcome.computed.len(), 6);
        for i in 0..6 {
            assert_eq!(
                record.get(&format!("f{}", i)),
                Some(&CellValue::Number(1.0 + i as f64))
            );
        }
    }

    #[tokio::test]
    async fn test_rollup_and_lookup_prefetch_linked_records() {
        let store = Arc::new(MemoryStore::new());
        let fields = vec![
            Field::with_id("amount", "lines", "Amount", FieldConfig::Number(Default::default())),
            Field::with_id(
                "items",
                "t1",
                "Items",
                FieldConfig::Link(LinkConfig {
                    linked_table_id: "lines".to_string(),
                    multiple: true,
                }),
            ),
            Field::with_id(
                "total",
                "t1",
                "Total",
                FieldConfig::Rollup(RollupConfig {
                    link_field_id: "items".to_string(),
                    target_field_id: "amount".to_string(),
                    expression: "sum".to_string(),
                }),
            ),
            Field::with_id(
                "amounts",
                "t1",
                "Amounts",
                FieldConfig::Lookup(LookupConfig {
                    link_field_id: "items".to_string(),
                    target_field_id: "amount".to_string(),
                }),
            ),
            formula("with_tax", "With Tax", "{Total} * 2"),
        ];
        for field in fields {
            store.save(field).await.unwrap();
        }
        for (id, amount) in [("l1", 3.0), ("l2", 4.5)] {
            let mut line = Record::new("lines", RecordData::new().with("amount", amount), "alice");
            line.id = id.to_string();
            store.save_record(line).await.unwrap();
        }

        let cache = Arc::new(FieldCache::new(store.clone()));
        let service = CalculationService::new(cache, store.clone(), Arc::new(FormulaEngine::new()));
        let mut order = Record::new(
            "t1",
            RecordData::new().with("items", CellValue::Links(vec!["l1".into(), "l2".into()])),
            "alice",
        );

        let outcome = service.calculate_all_fields(&mut order).await.unwrap();
        assert!(!outcome.has_failures());
        assert_eq!(order.get("total"), Some(&CellValue::Number(7.5)));
        assert_eq!(order.get("with_tax"), Some(&CellValue::Number(15.0)));
        assert_eq!(
            order.get("amounts"),
            Some(&CellValue::List(vec![CellValue::Number(3.0), CellValue::Number(4.5)]))
        );
    }

    #[tokio::test]
    async fn test_staged_linked_records_shadow_the_store() {
        let store = Arc::new(MemoryStore::new());
        let fields = vec![
            Field::with_id("amount", "lines", "Amount", FieldConfig::Number(Default::default())),
            Field::with_id(
                "items",
                "t1",
                "Items",
                FieldConfig::Link(LinkConfig {
                    linked_table_id: "lines".to_string(),
                    multiple: true,
                }),
            ),
            Field::with_id(
                "total",
                "t1",
                "Total",
                FieldConfig::Rollup(RollupConfig {
                    link_field_id: "items".to_string(),
                    target_field_id: "amount".to_string(),
                    expression: "sum".to_string(),
                }),
            ),
        ];
        for field in fields {
            store.save(field).await.unwrap();
        }
        for (id, amount) in [("l1", 3.0), ("l2", 4.5)] {
            let mut line = Record::new("lines", RecordData::new().with("amount", amount), "alice");
            line.id = id.to_string();
            store.save_record(line).await.unwrap();
        }

        // l1 edited, l2 deleted and l3 inserted, all uncommitted
        let mut tx = TransactionContext::new(0);
        let mut l1 = store.record("lines", "l1").await.unwrap();
        l1.data.insert("amount".to_string(), CellValue::Number(10.0));
        tx.stage_record(l1, Some(1));
        tx.stage_delete("lines", "l2", 1);
        let mut l3 = Record::new("lines", RecordData::new().with("amount", 1.0), "alice");
        l3.id = "l3".to_string();
        tx.stage_record(l3, None);

        let cache = Arc::new(FieldCache::new(store.clone()));
        let service = CalculationService::new(cache, store.clone(), Arc::new(FormulaEngine::new()));
        let order = |ids: &[&str]| {
            let links = CellValue::Links(ids.iter().map(|id| id.to_string()).collect());
            Record::new("t1", RecordData::new().with("items", links), "alice")
        };

        let mut staged_view = order(&["l1", "l3"]);
        service.calculate_all_fields_in(&tx, &mut staged_view).await.unwrap();
        assert_eq!(staged_view.get("total"), Some(&CellValue::Number(11.0)));

        let mut committed_view = order(&["l1", "l2"]);
        service.calculate_all_fields(&mut committed_view).await.unwrap();
        assert_eq!(committed_view.get("total"), Some(&CellValue::Number(7.5)));

        // A link to a record deleted in this unit of work no longer resolves
        let mut dangling = order(&["l2"]);
        let outcome = service.calculate_all_fields_in(&tx, &mut dangling).await.unwrap();
        assert!(outcome.has_failures());
        assert_eq!(dangling.get("total"), Some(&CellValue::Unset));
    }

    struct Exploding;

    impl Calculator for Exploding {
        fn field_type(&self) -> FieldType {
            FieldType::Formula
        }

        fn calculate(&self, _field: &Field, _ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
            panic!("evaluator crashed");
        }
    }

    #[tokio::test]
    async fn test_pooled_panic_is_infrastructure_error() {
        let fields = vec![number("a", "A"), formula("f1", "F1", "{A}"), formula("f2", "F2", "{A}")];
        let (store, _) = service_with(fields).await;
        let mut registry = CalculatorRegistry::new();
        registry.register(Arc::new(Exploding));

        let service = CalculationService::new(
            Arc::new(FieldCache::new(store.clone())),
            store.clone(),
            Arc::new(FormulaEngine::new()),
        )
        .with_calculators(registry)
        .with_pool(WorkerPool::new(2), 2);

        let mut record = Record::new("t1", RecordData::new().with("a", 1.0), "alice");
        let err = service.calculate_all_fields(&mut record).await.unwrap_err();
        assert!(matches!(err, EngineError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_store_outage_propagates() {
        let (store, service) = service_with(abcd_fields()).await;
        store.set_unavailable(true);
        let mut record = Record::new("t1", RecordData::new(), "alice");

        let err = service.calculate_all_fields(&mut record).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
