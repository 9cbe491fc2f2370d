//! Gridbase Core Computation Engine
//!
//! This crate keeps computed fields (formulas, rollups, lookups and counts)
//! consistent with the data they read, inside transactional units of work.
//!
//! # Architecture
//!
//! - **Graph per call**: dependency graphs are rebuilt from field definitions on
//!   every calculation, never cached
//! - **Per-field isolation**: a failing calculator tombstones its own cell and
//!   flags the field, the rest of the record still computes
//! - **Post-commit side effects**: events, broadcasts and cache invalidation
//!   only happen once a transaction has committed
//!
//! # Modules
//!
//! - [`models`] - Fields, records and cell values
//! - [`graph`] - Dependency graph and topological ordering
//! - [`expression`] - Formula parser and evaluator boundary
//! - [`calculators`] - Formula, rollup, lookup and count calculators
//! - [`db`] - Store traits, transactions, domain events and the memory store
//! - [`operations`] - Worker pool for concurrent evaluation levels
//! - [`services`] - Calculation, record and field services, event bus, engine

pub mod calculators;
pub mod config;
pub mod db;
pub mod expression;
pub mod graph;
pub mod logging;
pub mod models;
pub mod operations;
pub mod services;

// Re-export commonly used types
pub use config::EngineConfig;
pub use logging::init_tracing;
pub use services::{Engine, EngineError};
