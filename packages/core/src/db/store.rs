//! Store Traits
//!
//! The collaborator contracts the engine consumes. Reads go straight to the
//! store; writes made inside a unit of work are staged on the
//! [`TransactionContext`](super::TransactionContext) and handed to
//! [`TransactionProvider::commit`] as one atomic batch.
//!
//! All traits are `Send + Sync` so implementations can sit behind `Arc<dyn _>`
//! and be shared across tasks.

use super::{StagedWrite, StoreError};
use crate::models::{Field, FieldId, Record, RecordId};
use async_trait::async_trait;

/// Field definitions
#[async_trait]
pub trait FieldStore: Send + Sync {
    /// Fields of a table in definition order
    async fn find_by_table_id(&self, table_id: &str) -> Result<Vec<Field>, StoreError>;

    async fn find_by_id(&self, field_id: &str) -> Result<Option<Field>, StoreError>;

    /// Counter bumped by every committed change to the table's field
    /// definitions; pairs with [`StagedWrite::AssertFieldRevision`]
    async fn table_revision(&self, table_id: &str) -> Result<u64, StoreError>;

    /// Upsert outside any unit of work
    async fn save(&self, field: Field) -> Result<Field, StoreError>;

    /// Link fields, in any table, that point at `table_id`
    async fn find_links_to(&self, table_id: &str) -> Result<Vec<Field>, StoreError>;
}

/// Records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_record(&self, table_id: &str, record_id: &str) -> Result<Option<Record>, StoreError>;

    /// Batch fetch; IDs that do not exist are skipped
    async fn find_by_ids(&self, table_id: &str, ids: &[RecordId]) -> Result<Vec<Record>, StoreError>;

    /// Version-checked upsert outside any unit of work
    ///
    /// A new record must not exist yet; an existing one must be saved with
    /// exactly its stored version plus one.
    async fn save_record(&self, record: Record) -> Result<Record, StoreError>;

    /// Records of `table_id` whose `link_field_id` cell links to `record_id`
    async fn find_referencing(
        &self,
        table_id: &str,
        link_field_id: &FieldId,
        record_id: &str,
    ) -> Result<Vec<Record>, StoreError>;
}

/// Atomic commit of staged writes
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    /// Apply every write or none of them
    ///
    /// Must report lost races on row versions and stale field revisions as
    /// [`StoreError::Contention`] so the runner can retry the unit of work.
    async fn commit(&self, writes: Vec<StagedWrite>) -> Result<(), StoreError>;
}

/// Physical column provisioning (DDL lives behind this boundary)
///
/// Inside a unit of work columns are added through
/// [`StagedWrite::AddColumn`], so they commit together with their field.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Provision outside any unit of work; must be idempotent
    async fn add_column(&self, table_id: &str, field_id: &FieldId) -> Result<(), StoreError>;

    async fn drop_column(&self, table_id: &str, field_id: &FieldId) -> Result<(), StoreError>;
}
