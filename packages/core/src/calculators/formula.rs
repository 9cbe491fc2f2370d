use super::{CalculationContext, CalculationError, Calculator};
use crate::expression::{ExpressionError, ExpressionEvaluator, FormulaContext, RecordContext, TypedValue};
use crate::models::{CellValue, Field, FieldConfig, FieldType};
use std::sync::Arc;

/// Adapter from record data to an [`ExpressionEvaluator`]
///
/// The evaluator sees fields by name. Every field of the table is present in
/// the context; fields without a cell read as blank.
pub struct FormulaCalculator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl FormulaCalculator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    fn build_context(ctx: &CalculationContext<'_>) -> FormulaContext {
        let mut context = FormulaContext::with_capacity(ctx.fields.len());
        for field in ctx.fields.values() {
            let value = ctx
                .record
                .get(&field.id)
                .map(TypedValue::from)
                .unwrap_or(TypedValue::Null);
            context.insert(field.name.clone(), value.clone());
            // Expressions may also address a field by its ID
            context.entry(field.id.clone()).or_insert(value);
        }
        context
    }
}

impl Calculator for FormulaCalculator {
    fn field_type(&self) -> FieldType {
        FieldType::Formula
    }

    fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
        let FieldConfig::Formula(config) = &field.config else {
            return Err(CalculationError::invalid_config(&field.id, "expected formula configuration"));
        };

        let context = Self::build_context(ctx);
        let record = RecordContext {
            record_id: ctx.record.id.clone(),
            table_id: ctx.record.table_id.clone(),
        };
        let timezone = config.timezone.as_deref().unwrap_or(ctx.timezone);

        match self
            .evaluator
            .evaluate(&config.expression, &context, &record, timezone)
        {
            Ok(value) => Ok(CellValue::from(value)),
            // A reference to a field that no longer exists degrades to no value
            Err(ExpressionError::UnknownField(name)) => {
                tracing::debug!(
                    "Formula field '{}' references missing field '{}'",
                    field.id,
                    name
                );
                Ok(CellValue::Null)
            }
            Err(e) => Err(CalculationError::expression(&field.id, e)),
        }
    }
}
