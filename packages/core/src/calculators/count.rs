use super::{link_ids, CalculationContext, CalculationError, Calculator};
use crate::models::{CellValue, Field, FieldConfig, FieldType};

/// Number of linked records
///
/// Counts IDs in the link cell without resolving them, so it never needs
/// linked records and never fails on a dangling link.
pub struct CountCalculator;

impl Calculator for CountCalculator {
    fn field_type(&self) -> FieldType {
        FieldType::Count
    }

    fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
        let FieldConfig::Count(config) = &field.config else {
            return Err(CalculationError::invalid_config(&field.id, "expected count configuration"));
        };

        let ids = link_ids(ctx.record.get(&config.link_field_id));
        Ok(CellValue::Number(ids.len() as f64))
    }
}
