//! Per-Type Calculators
//!
//! One calculator per computed field type. Calculators are pure: they read the
//! record being computed, the table's field definitions and whatever linked
//! records the orchestrator prefetched, and return a cell value. They never
//! touch a store.
//!
//! A calculator error is scoped to one field. The orchestrator turns it into an
//! [`CellValue::Unset`] tombstone plus an error flag on the field and carries on
//! with the remaining fields.

mod count;
mod formula;
mod lookup;
mod rollup;

pub use count::CountCalculator;
pub use formula::FormulaCalculator;
pub use lookup::LookupCalculator;
pub use rollup::{RollupAggregation, RollupCalculator};

use crate::expression::{ExpressionError, ExpressionEvaluator};
use crate::models::{CellValue, Field, FieldId, FieldType, Record, RecordId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalculationError {
    #[error("Expression error in field '{field}': {source}")]
    Expression {
        field: FieldId,
        #[source]
        source: ExpressionError,
    },

    #[error("Field '{field}' links to record '{record_id}' which was not found")]
    MissingLinkedRecord { field: FieldId, record_id: RecordId },

    #[error("Field '{field}' has an invalid configuration: {message}")]
    InvalidConfig { field: FieldId, message: String },

    #[error("Unknown rollup aggregation '{expression}' in field '{field}'")]
    UnknownAggregation { field: FieldId, expression: String },

    #[error("No calculator registered for field type '{0}'")]
    Unsupported(FieldType),
}

impl CalculationError {
    pub fn expression(field: impl Into<String>, source: ExpressionError) -> Self {
        Self::Expression {
            field: field.into(),
            source,
        }
    }

    pub fn missing_linked_record(field: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::MissingLinkedRecord {
            field: field.into(),
            record_id: record_id.into(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Linked records prefetched by the orchestrator, keyed by record ID
#[derive(Debug, Clone, Default)]
pub struct LinkedRecords {
    records: HashMap<RecordId, Record>,
}

impl LinkedRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, record_id: &str) -> Option<&Record> {
        self.records.get(record_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve every ID, failing on the first one that was not prefetched
    pub fn resolve<'a>(
        &'a self,
        field_id: &str,
        ids: &[RecordId],
    ) -> Result<Vec<&'a Record>, CalculationError> {
        ids.iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| CalculationError::missing_linked_record(field_id, id))
            })
            .collect()
    }
}

impl FromIterator<Record> for LinkedRecords {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut linked = LinkedRecords::new();
        for record in iter {
            linked.insert(record);
        }
        linked
    }
}

/// Everything a calculator may read
#[derive(Debug, Clone, Copy)]
pub struct CalculationContext<'a> {
    pub record: &'a Record,
    pub fields: &'a HashMap<FieldId, Field>,
    pub linked: &'a LinkedRecords,
    pub timezone: &'a str,
}

/// Computes the value of one field type
pub trait Calculator: Send + Sync {
    fn field_type(&self) -> FieldType;

    fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError>;
}

/// Calculators by field type
#[derive(Clone, Default)]
pub struct CalculatorRegistry {
    calculators: HashMap<FieldType, Arc<dyn Calculator>>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formula, rollup, lookup and count calculators
    pub fn with_defaults(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FormulaCalculator::new(evaluator)));
        registry.register(Arc::new(RollupCalculator));
        registry.register(Arc::new(LookupCalculator));
        registry.register(Arc::new(CountCalculator));
        registry
    }

    /// Replaces any calculator already registered for the same type
    pub fn register(&mut self, calculator: Arc<dyn Calculator>) {
        self.calculators.insert(calculator.field_type(), calculator);
    }

    pub fn get(&self, field_type: FieldType) -> Option<&Arc<dyn Calculator>> {
        self.calculators.get(&field_type)
    }

    pub fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
        let calculator = self
            .get(field.field_type())
            .ok_or(CalculationError::Unsupported(field.field_type()))?;
        calculator.calculate(field, ctx)
    }
}

impl std::fmt::Debug for CalculatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.calculators.keys().map(FieldType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("CalculatorRegistry").field("types", &types).finish()
    }
}

/// Record IDs held by a link cell
///
/// Accepts the canonical `Links` form, a single ID stored as text, and a list
/// of text IDs. Anything else holds no links.
pub fn link_ids(value: Option<&CellValue>) -> Vec<RecordId> {
    match value {
        Some(CellValue::Links(ids)) => ids.clone(),
        Some(CellValue::Text(id)) if !id.is_empty() => vec![id.clone()],
        Some(CellValue::List(items)) => items
            .iter()
            .filter_map(|item| item.as_text().filter(|s| !s.is_empty()).map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Whether a link cell holds a single ID rather than a collection
pub(crate) fn is_single_link(field: Option<&Field>, value: Option<&CellValue>) -> bool {
    if matches!(value, Some(CellValue::Text(_))) {
        return true;
    }
    matches!(
        field.map(|f| &f.config),
        Some(crate::models::FieldConfig::Link(link)) if !link.multiple
    )
}
