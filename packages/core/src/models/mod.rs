//! Data Models
//!
//! This module contains the core data structures of the engine:
//!
//! - `Field` - Typed column definition with a tagged, per-type configuration
//! - `Record` - Row of a table with a strongly typed cell map
//!
//! Both are plain values; persistence goes through the store traits in [`crate::db`].

mod field;
mod record;

pub use field::{
    CountConfig, Field, FieldConfig, FieldId, FieldType, FormulaConfig, LinkConfig, LookupConfig,
    NumberConfig, RollupConfig, SelectConfig, ValidationError,
};
pub use record::{CellValue, Record, RecordData, RecordId};
