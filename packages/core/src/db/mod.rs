//! Storage Layer
//!
//! Store contracts, transactional coordination and domain events:
//!
//! - [`FieldStore`], [`RecordStore`], [`SchemaProvider`], [`TransactionProvider`]:
//!   the collaborator traits the engine consumes
//! - [`TransactionManager`] / [`TransactionContext`]: atomic units of work with
//!   staged writes, post-commit callbacks and retry on contention
//! - [`DomainEvent`]: what happened, published only after commit
//! - [`MemoryStore`]: in-memory backend implementing every trait
//!
//! Physical DDL and durable storage engines live behind these traits and are
//! not part of this crate.

mod error;
pub mod events;
mod memory;
mod store;
mod transaction;

pub use error::StoreError;
pub use events::{dedup_events, DomainEvent, EventKind};
pub use memory::MemoryStore;
pub use store::{FieldStore, RecordStore, SchemaProvider, TransactionProvider};
pub use transaction::{
    EventPublisher, StagedWrite, TransactionContext, TransactionManager, TransactionOptions, TxFuture,
};
