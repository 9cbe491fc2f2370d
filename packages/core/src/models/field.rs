//! Field Definitions
//!
//! A field is a typed column of a table. Plain fields (text, number, link, ...)
//! hold user-written values; computed fields (formula, rollup, lookup, count)
//! derive their value from other fields and are never written directly.
//!
//! # Configuration
//!
//! Each field type has exactly one configuration shape, carried by the
//! [`FieldConfig`] variant. The JSON form is adjacently tagged:
//!
//! ```json
//! {
//!   "id": "fld-total",
//!   "tableId": "tbl-orders",
//!   "name": "Total",
//!   "config": {
//!     "type": "rollup",
//!     "options": {
//!       "linkFieldId": "fld-lines",
//!       "targetFieldId": "fld-amount",
//!       "expression": "sum"
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Field identifier (UUID string, or any caller-chosen unique string)
pub type FieldId = String;

/// Validation errors for field configuration and record writes
///
/// These are raised before anything is persisted and are surfaced to the
/// caller verbatim.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field name cannot be empty")]
    MissingName,

    #[error("Field '{field}' is missing required configuration: {key}")]
    MissingConfig { field: String, key: String },

    #[error("Field '{field}' references unknown field '{reference}'")]
    UnknownFieldReference { field: String, reference: String },

    #[error("Field '{field}' has an invalid reference: {reason}")]
    InvalidReference { field: String, reason: String },

    #[error("Field '{field}' has an invalid expression: {message}")]
    InvalidExpression { field: String, message: String },

    #[error("Cyclic dependency detected between fields: {}", fields.join(" -> "))]
    CyclicDependency { fields: Vec<FieldId> },

    #[error("Field '{field}' is computed and cannot be written directly")]
    ComputedFieldWrite { field: String },

    #[error("Unknown field '{field}' for table '{table_id}'")]
    UnknownField { field: String, table_id: String },

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    pub fn missing_config(field: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingConfig {
            field: field.into(),
            key: key.into(),
        }
    }

    pub fn unknown_reference(field: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::UnknownFieldReference {
            field: field.into(),
            reference: reference.into(),
        }
    }

    pub fn invalid_reference(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Type tag of a field, without its configuration payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    LongText,
    Number,
    Checkbox,
    Select,
    Date,
    Link,
    Formula,
    Rollup,
    Lookup,
    Count,
}

impl FieldType {
    /// Whether values of this type are derived rather than written by users
    pub fn is_computed(&self) -> bool {
        matches!(
            self,
            FieldType::Formula | FieldType::Rollup | FieldType::Lookup | FieldType::Count
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::LongText => "long_text",
            FieldType::Number => "number",
            FieldType::Checkbox => "checkbox",
            FieldType::Select => "select",
            FieldType::Date => "date",
            FieldType::Link => "link",
            FieldType::Formula => "formula",
            FieldType::Rollup => "rollup",
            FieldType::Lookup => "lookup",
            FieldType::Count => "count",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectConfig {
    #[serde(default)]
    pub choices: Vec<String>,
}

/// Link to records of another (or the same) table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    pub linked_table_id: String,

    /// `false` restricts the cell to a single linked record
    #[serde(default = "default_true")]
    pub multiple: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaConfig {
    /// Expression referencing other fields as `{Field Name}` or `{field-id}`
    pub expression: String,

    /// Overrides the engine's default timezone for this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupConfig {
    pub link_field_id: FieldId,
    pub target_field_id: FieldId,

    /// Aggregation, e.g. `"sum"`, `"avg"` or `"MAX(values)"`
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupConfig {
    pub link_field_id: FieldId,
    pub target_field_id: FieldId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountConfig {
    pub link_field_id: FieldId,
}

/// Type-specific field configuration, one shape per field type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum FieldConfig {
    Text,
    LongText,
    Number(NumberConfig),
    Checkbox,
    Select(SelectConfig),
    Date,
    Link(LinkConfig),
    Formula(FormulaConfig),
    Rollup(RollupConfig),
    Lookup(LookupConfig),
    Count(CountConfig),
}

impl FieldConfig {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldConfig::Text => FieldType::Text,
            FieldConfig::LongText => FieldType::LongText,
            FieldConfig::Number(_) => FieldType::Number,
            FieldConfig::Checkbox => FieldType::Checkbox,
            FieldConfig::Select(_) => FieldType::Select,
            FieldConfig::Date => FieldType::Date,
            FieldConfig::Link(_) => FieldType::Link,
            FieldConfig::Formula(_) => FieldType::Formula,
            FieldConfig::Rollup(_) => FieldType::Rollup,
            FieldConfig::Lookup(_) => FieldType::Lookup,
            FieldConfig::Count(_) => FieldType::Count,
        }
    }

    /// The link field a rollup/lookup/count goes through
    pub fn link_field_id(&self) -> Option<&str> {
        match self {
            FieldConfig::Rollup(c) => Some(&c.link_field_id),
            FieldConfig::Lookup(c) => Some(&c.link_field_id),
            FieldConfig::Count(c) => Some(&c.link_field_id),
            _ => None,
        }
    }

    /// The field read from linked records by a rollup/lookup
    pub fn target_field_id(&self) -> Option<&str> {
        match self {
            FieldConfig::Rollup(c) => Some(&c.target_field_id),
            FieldConfig::Lookup(c) => Some(&c.target_field_id),
            _ => None,
        }
    }
}

/// A typed column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: FieldId,
    pub table_id: String,
    pub name: String,
    pub config: FieldConfig,

    /// Transient error flag, set when the last calculation of this field failed
    #[serde(default)]
    pub has_error: bool,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Field {
    /// Create a field with a generated ID
    pub fn new(table_id: impl Into<String>, name: impl Into<String>, config: FieldConfig) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), table_id, name, config)
    }

    /// Create a field with a caller-chosen ID
    pub fn with_id(
        id: impl Into<String>,
        table_id: impl Into<String>,
        name: impl Into<String>,
        config: FieldConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            table_id: table_id.into(),
            name: name.into(),
            config,
            has_error: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.config.field_type()
    }

    pub fn is_computed(&self) -> bool {
        self.field_type().is_computed()
    }

    /// Structural validation of the configuration payload
    ///
    /// Only checks what can be checked without looking at sibling fields:
    /// required keys present and non-empty. Reference resolution and cycle
    /// detection happen in `FieldService` against the table's field set.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }

        let require = |value: &str, key: &str| {
            if value.trim().is_empty() {
                Err(ValidationError::missing_config(&self.name, key))
            } else {
                Ok(())
            }
        };

        match &self.config {
            FieldConfig::Link(c) => require(&c.linked_table_id, "linkedTableId"),
            FieldConfig::Formula(c) => require(&c.expression, "expression"),
            FieldConfig::Rollup(c) => {
                require(&c.link_field_id, "linkFieldId")?;
                require(&c.target_field_id, "targetFieldId")?;
                require(&c.expression, "expression")
            }
            FieldConfig::Lookup(c) => {
                require(&c.link_field_id, "linkFieldId")?;
                require(&c.target_field_id, "targetFieldId")
            }
            FieldConfig::Count(c) => require(&c.link_field_id, "linkFieldId"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_computed_flag_follows_type() {
        let text = Field::new("t1", "Name", FieldConfig::Text);
        let formula = Field::new(
            "t1",
            "Double",
            FieldConfig::Formula(FormulaConfig {
                expression: "{A} * 2".to_string(),
                timezone: None,
            }),
        );

        assert!(!text.is_computed());
        assert!(formula.is_computed());
        assert!(FieldType::Count.is_computed());
        assert!(!FieldType::Link.is_computed());
    }

    #[test]
    fn test_validate_rejects_missing_config() {
        let rollup = Field::new(
            "t1",
            "Total",
            FieldConfig::Rollup(RollupConfig {
                link_field_id: "fld-link".to_string(),
                target_field_id: "".to_string(),
                expression: "sum".to_string(),
            }),
        );

        assert_eq!(
            rollup.validate(),
            Err(ValidationError::missing_config("Total", "targetFieldId"))
        );

        let unnamed = Field::new("t1", "  ", FieldConfig::Text);
        assert_eq!(unnamed.validate(), Err(ValidationError::MissingName));
    }

    #[test]
    fn test_config_serialization_is_adjacently_tagged() {
        let field = Field::with_id(
            "fld-count",
            "t1",
            "Lines",
            FieldConfig::Count(CountConfig {
                link_field_id: "fld-link".to_string(),
            }),
        );

        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(value["config"]["type"], "count");
        assert_eq!(value["config"]["options"]["linkFieldId"], "fld-link");
        assert_eq!(value["tableId"], "t1");
        assert_eq!(value["hasError"], false);
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let config: FieldConfig = serde_json::from_value(json!({
            "type": "link",
            "options": { "linkedTableId": "tbl-2" }
        }))
        .unwrap();

        match config {
            FieldConfig::Link(link) => {
                assert_eq!(link.linked_table_id, "tbl-2");
                assert!(link.multiple);
            }
            other => panic!("Expected link config, got {:?}", other),
        }

        let text: FieldConfig = serde_json::from_value(json!({ "type": "text" })).unwrap();
        assert_eq!(text.field_type(), FieldType::Text);
    }

    #[test]
    fn test_link_and_target_accessors() {
        let lookup = FieldConfig::Lookup(LookupConfig {
            link_field_id: "l".to_string(),
            target_field_id: "t".to_string(),
        });
        assert_eq!(lookup.link_field_id(), Some("l"));
        assert_eq!(lookup.target_field_id(), Some("t"));
        assert_eq!(FieldConfig::Date.link_field_id(), None);
    }
}
