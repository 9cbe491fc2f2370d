//! Field Dependency Graph
//!
//! Directed graph of "field A feeds field B" edges, derived from field
//! definitions on every invocation (never cached, so concurrent field edits
//! cannot leave a stale graph behind).
//!
//! # Edges
//!
//! - Formula: every `{ref}` in the expression, resolved by field ID or name
//! - Rollup / Lookup: the link field and the target field
//! - Count: the link field
//!
//! Only computed fields are ordered; plain fields are roots that never need
//! evaluating. References that do not resolve to a field of the table are
//! dropped from the edge set and the field later computes to "no value".
//!
//! # Ordering
//!
//! [`topological_sort`] runs Kahn's algorithm over [`TopologicalItem`]s and
//! fails with [`GraphError::CycleDetected`] instead of emitting a partial
//! order. [`DependencyGraph::evaluation_levels`] groups the same order into
//! layers whose members have no edges between them, which is what the
//! orchestrator fans out concurrently.

mod dependency_graph;

pub use dependency_graph::{topological_sort, DependencyGraph, TopologicalItem};
pub(crate) use dependency_graph::scan_field_refs;

use crate::models::FieldId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The listed fields could not be ordered because they form (or depend on) a cycle
    #[error("Cyclic dependency among fields: {}", fields.join(", "))]
    CycleDetected { fields: Vec<FieldId> },
}
