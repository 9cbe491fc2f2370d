use super::{is_single_link, link_ids, CalculationContext, CalculationError, Calculator};
use crate::models::{CellValue, Field, FieldConfig, FieldType};

/// Copies a target field's value(s) from linked records
pub struct LookupCalculator;

/// Drop empty entries at every nesting depth, keeping the nesting itself
fn strip_empty(value: &CellValue) -> CellValue {
    match value {
        CellValue::List(items) => CellValue::List(
            items
                .iter()
                .filter(|item| !item.is_empty())
                .map(strip_empty)
                .collect(),
        ),
        CellValue::Unset => CellValue::Null,
        other => other.clone(),
    }
}

impl Calculator for LookupCalculator {
    fn field_type(&self) -> FieldType {
        FieldType::Lookup
    }

    fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
        let FieldConfig::Lookup(config) = &field.config else {
            return Err(CalculationError::invalid_config(&field.id, "expected lookup configuration"));
        };

        let link_value = ctx.record.get(&config.link_field_id);
        let ids = link_ids(link_value);
        if ids.is_empty() {
            return Ok(CellValue::Null);
        }

        let linked = ctx.linked.resolve(&field.id, &ids)?;
        let mut values: Vec<CellValue> = linked
            .iter()
            .map(|record| record.get(&config.target_field_id).cloned().unwrap_or_default())
            .collect();

        if is_single_link(ctx.fields.get(&config.link_field_id), link_value) && values.len() == 1 {
            return Ok(strip_empty(&values.remove(0)));
        }

        Ok(strip_empty(&CellValue::List(values)))
    }
}
