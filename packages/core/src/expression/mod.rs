//! Expression Evaluation
//!
//! The formula calculator is a thin adapter over an [`ExpressionEvaluator`].
//! The evaluator boundary is the only place where cell values travel in a
//! string-keyed map ([`FormulaContext`]): expressions address fields by name,
//! while the engine keys record data by field ID.
//!
//! [`FormulaEngine`] is the built-in evaluator. Any other implementation can be
//! injected into the engine; if it can enumerate the field references of an
//! expression with its own parser, the dependency graph uses that instead of
//! the plain `{ref}` token scan.

mod engine;
mod parser;

pub use engine::FormulaEngine;
pub use parser::{parse, Expr};

use crate::models::{CellValue, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while parsing or evaluating an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unknown field reference: {0}")]
    UnknownField(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {name} expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

impl ExpressionError {
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch(message.into())
    }
}

/// Typed result of an expression
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<TypedValue>),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// Truthiness used by `IF`, `AND`, `OR` and `NOT`
    pub fn is_truthy(&self) -> bool {
        match self {
            TypedValue::Null => false,
            TypedValue::Bool(b) => *b,
            TypedValue::Number(n) => *n != 0.0,
            TypedValue::Text(s) => !s.is_empty(),
            TypedValue::List(items) => !items.is_empty(),
        }
    }

    /// Text rendering used by concatenation
    pub fn to_text(&self) -> String {
        match self {
            TypedValue::Null => String::new(),
            TypedValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            TypedValue::Number(n) => format_number(*n),
            TypedValue::Text(s) => s.clone(),
            TypedValue::List(items) => items
                .iter()
                .map(TypedValue::to_text)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl From<&CellValue> for TypedValue {
    fn from(value: &CellValue) -> Self {
        match value {
            CellValue::Null | CellValue::Unset => TypedValue::Null,
            CellValue::Bool(b) => TypedValue::Bool(*b),
            CellValue::Number(n) => TypedValue::Number(*n),
            CellValue::Text(s) => TypedValue::Text(s.clone()),
            CellValue::Links(ids) => {
                TypedValue::List(ids.iter().map(|id| TypedValue::Text(id.clone())).collect())
            }
            CellValue::List(items) => TypedValue::List(items.iter().map(TypedValue::from).collect()),
        }
    }
}

impl From<TypedValue> for CellValue {
    fn from(value: TypedValue) -> Self {
        match value {
            TypedValue::Null => CellValue::Null,
            TypedValue::Bool(b) => CellValue::Bool(b),
            TypedValue::Number(n) if n.is_finite() => CellValue::Number(n),
            TypedValue::Number(_) => CellValue::Null,
            TypedValue::Text(s) => CellValue::Text(s),
            TypedValue::List(items) => CellValue::List(items.into_iter().map(CellValue::from).collect()),
        }
    }
}

/// Field values visible to an expression, keyed by field name
pub type FormulaContext = HashMap<String, TypedValue>;

/// Metadata of the record an expression is evaluated for
#[derive(Debug, Clone, Default)]
pub struct RecordContext {
    pub record_id: RecordId,
    pub table_id: String,
}

/// External expression evaluator contract
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `context`
    fn evaluate(
        &self,
        expression: &str,
        context: &FormulaContext,
        record: &RecordContext,
        timezone: &str,
    ) -> Result<TypedValue, ExpressionError>;

    /// Field references used by `expression`, as written between braces
    ///
    /// `None` means the evaluator cannot tell, and callers fall back to a
    /// token scan.
    fn referenced_fields(&self, _expression: &str) -> Option<Result<Vec<String>, ExpressionError>> {
        None
    }
}
