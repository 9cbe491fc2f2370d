use super::{link_ids, CalculationContext, CalculationError, Calculator};
use crate::expression::TypedValue;
use crate::models::{CellValue, Field, FieldConfig, FieldType};

/// Aggregations a rollup can apply over linked values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupAggregation {
    Sum,
    Average,
    Min,
    Max,
    /// Non-empty values
    Count,
    /// Linked records, empty or not
    CountAll,
    And,
    Or,
    Concatenate,
    ArrayUnique,
    ArrayCompact,
}

impl RollupAggregation {
    /// Parse `"sum"`, `"SUM(values)"`, `"avg"`, ... (case-insensitive)
    pub fn parse(expression: &str) -> Option<Self> {
        let trimmed = expression.trim();
        let name = match trimmed.find('(') {
            Some(open) if trimmed.ends_with(')') => &trimmed[..open],
            Some(_) => return None,
            None => trimmed,
        };

        let aggregation = match name.trim().to_ascii_lowercase().as_str() {
            "sum" => Self::Sum,
            "avg" | "average" => Self::Average,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "counta" | "countall" => Self::CountAll,
            "and" => Self::And,
            "or" => Self::Or,
            "concatenate" | "array_join" | "arrayjoin" => Self::Concatenate,
            "array_unique" | "arrayunique" => Self::ArrayUnique,
            "array_compact" | "arraycompact" => Self::ArrayCompact,
            _ => return None,
        };
        Some(aggregation)
    }

    /// Result when nothing is linked
    ///
    /// Only the counting aggregations have a zero identity.
    pub fn empty_value(&self) -> CellValue {
        match self {
            Self::Count | Self::CountAll => CellValue::Number(0.0),
            _ => CellValue::Null,
        }
    }

    /// Aggregate target values of `linked_count` linked records
    pub fn apply(&self, values: &[CellValue], linked_count: usize) -> CellValue {
        let present: Vec<&CellValue> = values.iter().filter(|v| !v.is_empty()).collect();
        let numbers: Vec<f64> = present.iter().filter_map(|v| numeric(v)).collect();

        match self {
            Self::Sum => CellValue::Number(numbers.iter().sum()),
            Self::Average if numbers.is_empty() => CellValue::Null,
            Self::Average => CellValue::Number(numbers.iter().sum::<f64>() / numbers.len() as f64),
            Self::Min => numbers
                .iter()
                .copied()
                .reduce(f64::min)
                .map(CellValue::Number)
                .unwrap_or(CellValue::Null),
            Self::Max => numbers
                .iter()
                .copied()
                .reduce(f64::max)
                .map(CellValue::Number)
                .unwrap_or(CellValue::Null),
            Self::Count => CellValue::Number(present.len() as f64),
            Self::CountAll => CellValue::Number(linked_count as f64),
            Self::And => CellValue::Bool(
                !values.is_empty() && values.iter().all(|v| TypedValue::from(v).is_truthy()),
            ),
            Self::Or => CellValue::Bool(values.iter().any(|v| TypedValue::from(v).is_truthy())),
            Self::Concatenate => CellValue::Text(
                present
                    .iter()
                    .map(|v| TypedValue::from(*v).to_text())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Self::ArrayUnique => {
                let mut unique: Vec<CellValue> = Vec::new();
                for value in present {
                    if !unique.contains(value) {
                        unique.push(value.clone());
                    }
                }
                CellValue::List(unique)
            }
            Self::ArrayCompact => CellValue::List(present.into_iter().cloned().collect()),
        }
    }
}

fn numeric(value: &CellValue) -> Option<f64> {
    match value {
        CellValue::Number(n) => Some(*n),
        CellValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        CellValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Lists coming from lookup targets are aggregated element-wise
fn flatten_into(value: &CellValue, out: &mut Vec<CellValue>) {
    match value {
        CellValue::List(items) => items.iter().for_each(|item| flatten_into(item, out)),
        other => out.push(other.clone()),
    }
}

/// Aggregates a target field over linked records
pub struct RollupCalculator;

impl Calculator for RollupCalculator {
    fn field_type(&self) -> FieldType {
        FieldType::Rollup
    }

    fn calculate(&self, field: &Field, ctx: &CalculationContext<'_>) -> Result<CellValue, CalculationError> {
        let FieldConfig::Rollup(config) = &field.config else {
            return Err(CalculationError::invalid_config(&field.id, "expected rollup configuration"));
        };
        let aggregation = RollupAggregation::parse(&config.expression).ok_or_else(|| {
            CalculationError::UnknownAggregation {
                field: field.id.clone(),
                expression: config.expression.clone(),
            }
        })?;

        let ids = link_ids(ctx.record.get(&config.link_field_id));
        if ids.is_empty() {
            return Ok(aggregation.empty_value());
        }

        let linked = ctx.linked.resolve(&field.id, &ids)?;
        let mut values = Vec::with_capacity(linked.len());
        for record in &linked {
            flatten_into(
                record.get(&config.target_field_id).unwrap_or(&CellValue::Null),
                &mut values,
            );
        }

        Ok(aggregation.apply(&values, ids.len()))
    }
}
