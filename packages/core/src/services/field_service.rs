//! Field Service - Field Lifecycle
//!
//! Creates, updates and deletes field definitions inside a unit of work.
//! Everything that can make a table uncomputable is rejected before a write
//! is staged:
//!
//! - structural configuration problems (`Field::validate`)
//! - formula references that resolve to no field of the table
//! - link/target references that do not exist or have the wrong type
//! - unknown rollup aggregations
//! - dependency cycles in the prospective field set
//!
//! Physical columns of stored fields are staged with the field and commit
//! together with it; dropped columns go through the [`SchemaProvider`] after
//! commit. Computed fields have no column. Deleting a field flags every field
//! that read from it with the error state.
//!
//! # Concurrent definition changes
//!
//! Validation runs against the table's fields as read at the start of the
//! unit of work. Each change therefore stages an
//! [`AssertFieldRevision`](StagedWrite::AssertFieldRevision) taken before that
//! read: if another unit of work changed the table's fields in between, the
//! commit reports contention and the retry validates against the new set.

use crate::calculators::RollupAggregation;
use crate::db::{
    DomainEvent, EventKind, FieldStore, SchemaProvider, StagedWrite, StoreError, TransactionContext,
    TransactionManager,
};
use crate::expression::ExpressionEvaluator;
use crate::graph::DependencyGraph;
use crate::models::{Field, FieldConfig, FieldId, ValidationError};
use crate::services::EngineError;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct FieldService {
    fields: Arc<dyn FieldStore>,
    schema: Arc<dyn SchemaProvider>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    transactions: TransactionManager,
}

impl FieldService {
    pub fn new(
        fields: Arc<dyn FieldStore>,
        schema: Arc<dyn SchemaProvider>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        transactions: TransactionManager,
    ) -> Self {
        Self {
            fields,
            schema,
            evaluator,
            transactions,
        }
    }

    pub async fn get_field(&self, field_id: &str) -> Result<Option<Field>, EngineError> {
        Ok(self.fields.find_by_id(field_id).await?)
    }

    pub async fn list_fields(&self, table_id: &str) -> Result<Vec<Field>, EngineError> {
        Ok(self.fields.find_by_table_id(table_id).await?)
    }

    #[instrument(skip(self, field), fields(field_id = %field.id, table_id = %field.table_id))]
    pub async fn create_field(&self, field: Field, actor: &str) -> Result<Field, EngineError> {
        let this = self.clone();
        let actor = actor.to_string();
        self.transactions
            .run_in_transaction(None, None, move |tx| {
                let this = this.clone();
                let field = field.clone();
                let actor = actor.clone();
                Box::pin(async move { this.create_field_in(tx, field, &actor).await })
            })
            .await
    }

    pub async fn create_field_in(
        &self,
        tx: &mut TransactionContext,
        mut field: Field,
        actor: &str,
    ) -> Result<Field, EngineError> {
        field.validate()?;

        let revision = self.fields.table_revision(&field.table_id).await?;
        let mut table_fields = self.fields.find_by_table_id(&field.table_id).await?;
        if table_fields.iter().any(|f| f.id == field.id) || self.fields.find_by_id(&field.id).await?.is_some() {
            return Err(StoreError::DuplicateKey {
                entity: "Field",
                id: field.id.clone(),
            }
            .into());
        }
        ensure_unique_name(&table_fields, &field)?;

        field.has_error = false;
        table_fields.push(field.clone());
        self.validate_references(&field, &table_fields).await?;
        self.ensure_acyclic(&table_fields)?;

        tx.assert_field_revision(&field.table_id, revision);
        tx.stage(StagedWrite::SaveField(field.clone()));
        if !field.is_computed() {
            stage_add_column(tx, &field);
        }
        tx.add_event(DomainEvent::field_event(EventKind::FieldCreated, &field, actor));
        debug!("Staged new {} field {} ({})", field.field_type(), field.id, field.name);
        Ok(field)
    }

    /// Replace a field's name and configuration
    ///
    /// The table cannot change. A type change between stored and computed
    /// provisions or drops the physical column accordingly.
    #[instrument(skip(self, field), fields(field_id = %field.id, table_id = %field.table_id))]
    pub async fn update_field(&self, field: Field, actor: &str) -> Result<Field, EngineError> {
        let this = self.clone();
        let actor = actor.to_string();
        self.transactions
            .run_in_transaction(None, None, move |tx| {
                let this = this.clone();
                let field = field.clone();
                let actor = actor.clone();
                Box::pin(async move { this.update_field_in(tx, field, &actor).await })
            })
            .await
    }

    pub async fn update_field_in(
        &self,
        tx: &mut TransactionContext,
        mut field: Field,
        actor: &str,
    ) -> Result<Field, EngineError> {
        let revision = self.fields.table_revision(&field.table_id).await?;
        let existing = self
            .fields
            .find_by_id(&field.id)
            .await?
            .ok_or_else(|| EngineError::field_not_found(&field.id))?;
        if existing.table_id != field.table_id {
            return Err(ValidationError::invalid_reference(&field.name, "a field cannot move to another table").into());
        }
        field.validate()?;

        let mut table_fields: Vec<Field> = self
            .fields
            .find_by_table_id(&field.table_id)
            .await?
            .into_iter()
            .filter(|f| f.id != field.id)
            .collect();
        ensure_unique_name(&table_fields, &field)?;

        field.created_at = existing.created_at;
        field.modified_at = Utc::now();
        field.has_error = false;
        table_fields.push(field.clone());
        self.validate_references(&field, &table_fields).await?;
        self.ensure_acyclic(&table_fields)?;

        tx.assert_field_revision(&field.table_id, revision);
        tx.stage(StagedWrite::SaveField(field.clone()));
        match (existing.is_computed(), field.is_computed()) {
            (true, false) => stage_add_column(tx, &field),
            (false, true) => self.drop_column_after_commit(tx, &field),
            _ => {}
        }
        tx.add_event(DomainEvent::field_event(EventKind::FieldUpdated, &field, actor));
        Ok(field)
    }

    /// Delete a field and flag the fields that read from it
    #[instrument(skip(self))]
    pub async fn delete_field(&self, field_id: &str, actor: &str) -> Result<Field, EngineError> {
        let this = self.clone();
        let field_id = field_id.to_string();
        let actor = actor.to_string();
        self.transactions
            .run_in_transaction(None, None, move |tx| {
                let this = this.clone();
                let field_id = field_id.clone();
                let actor = actor.clone();
                Box::pin(async move { this.delete_field_in(tx, &field_id, &actor).await })
            })
            .await
    }

    pub async fn delete_field_in(
        &self,
        tx: &mut TransactionContext,
        field_id: &str,
        actor: &str,
    ) -> Result<Field, EngineError> {
        let field = self
            .fields
            .find_by_id(field_id)
            .await?
            .ok_or_else(|| EngineError::field_not_found(field_id))?;
        let revision = self.fields.table_revision(&field.table_id).await?;
        // Re-read at the revision
        let field = self
            .fields
            .find_by_id(field_id)
            .await?
            .ok_or_else(|| EngineError::field_not_found(field_id))?;

        let dangling = self.dependents_across_tables(&field).await?;
        for dependent in &dangling {
            tx.stage_field_error(dependent, true);
        }
        if !dangling.is_empty() {
            warn!("Deleting field {} leaves {} dependent field(s) dangling", field.id, dangling.len());
        }

        if !field.is_computed() {
            self.drop_column_after_commit(tx, &field);
        }
        tx.assert_field_revision(&field.table_id, revision);
        tx.stage(StagedWrite::DeleteField {
            field_id: field.id.clone(),
        });
        tx.add_event(DomainEvent::field_event(EventKind::FieldDeleted, &field, actor));
        Ok(field)
    }

    /// Fields that read `field`: same-table graph dependents plus rollups and
    /// lookups elsewhere that target it through a link
    async fn dependents_across_tables(&self, field: &Field) -> Result<Vec<FieldId>, EngineError> {
        let table_fields = self.fields.find_by_table_id(&field.table_id).await?;
        let graph = DependencyGraph::build_with(&table_fields, Some(self.evaluator.as_ref()));
        let mut dependents: Vec<FieldId> = graph.dependents_of(&field.id).to_vec();

        for link in self.fields.find_links_to(&field.table_id).await? {
            let fields = if link.table_id == field.table_id {
                table_fields.clone()
            } else {
                self.fields.find_by_table_id(&link.table_id).await?
            };
            for candidate in fields {
                let reads_target = candidate.config.link_field_id() == Some(link.id.as_str())
                    && candidate.config.target_field_id() == Some(field.id.as_str());
                if reads_target && !dependents.contains(&candidate.id) {
                    dependents.push(candidate.id);
                }
            }
        }
        Ok(dependents)
    }

    async fn validate_references(&self, field: &Field, table_fields: &[Field]) -> Result<(), EngineError> {
        let resolves = |reference: &str| table_fields.iter().any(|f| f.id == reference || f.name == reference);

        match &field.config {
            FieldConfig::Formula(formula) => {
                let references = match self.evaluator.referenced_fields(&formula.expression) {
                    Some(Ok(references)) => references,
                    Some(Err(e)) => {
                        return Err(ValidationError::InvalidExpression {
                            field: field.name.clone(),
                            message: e.to_string(),
                        }
                        .into());
                    }
                    None => crate::graph::scan_field_refs(&formula.expression),
                };
                if let Some(unknown) = references.iter().find(|r| !resolves(r.as_str())) {
                    return Err(ValidationError::unknown_reference(&field.name, unknown).into());
                }
                Ok(())
            }
            FieldConfig::Rollup(rollup) => {
                if RollupAggregation::parse(&rollup.expression).is_none() {
                    return Err(ValidationError::InvalidExpression {
                        field: field.name.clone(),
                        message: format!("unknown aggregation '{}'", rollup.expression),
                    }
                    .into());
                }
                self.validate_link_target(field, table_fields, &rollup.link_field_id, Some(&rollup.target_field_id))
                    .await
            }
            FieldConfig::Lookup(lookup) => {
                self.validate_link_target(field, table_fields, &lookup.link_field_id, Some(&lookup.target_field_id))
                    .await
            }
            FieldConfig::Count(count) => {
                self.validate_link_target(field, table_fields, &count.link_field_id, None)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn validate_link_target(
        &self,
        field: &Field,
        table_fields: &[Field],
        link_field_id: &str,
        target_field_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let link = table_fields
            .iter()
            .find(|f| f.id == link_field_id)
            .ok_or_else(|| ValidationError::unknown_reference(&field.name, link_field_id))?;
        let FieldConfig::Link(link_config) = &link.config else {
            return Err(ValidationError::invalid_reference(
                &field.name,
                format!("'{}' is not a link field", link.name),
            )
            .into());
        };

        if let Some(target) = target_field_id {
            let linked_fields = if link_config.linked_table_id == field.table_id {
                table_fields.to_vec()
            } else {
                self.fields.find_by_table_id(&link_config.linked_table_id).await?
            };
            if !linked_fields.iter().any(|f| f.id == target) {
                return Err(ValidationError::invalid_reference(
                    &field.name,
                    format!("target field '{}' not found in table '{}'", target, link_config.linked_table_id),
                )
                .into());
            }
        }
        Ok(())
    }

    fn ensure_acyclic(&self, fields: &[Field]) -> Result<(), ValidationError> {
        let graph = DependencyGraph::build_with(fields, Some(self.evaluator.as_ref()));
        match graph.detect_cycle() {
            Some(cycle) => Err(ValidationError::CyclicDependency { fields: cycle }),
            None => Ok(()),
        }
    }

    fn drop_column_after_commit(&self, tx: &mut TransactionContext, field: &Field) {
        let schema = self.schema.clone();
        let table_id = field.table_id.clone();
        let field_id = field.id.clone();
        tx.on_commit(move || async move {
            if let Err(e) = schema.drop_column(&table_id, &field_id).await {
                warn!("Failed to drop column {} of table {}: {}", field_id, table_id, e);
            }
        });
    }
}

fn stage_add_column(tx: &mut TransactionContext, field: &Field) {
    tx.stage(StagedWrite::AddColumn {
        table_id: field.table_id.clone(),
        field_id: field.id.clone(),
    });
}

fn ensure_unique_name(table_fields: &[Field], field: &Field) -> Result<(), ValidationError> {
    if table_fields.iter().any(|f| f.name == field.name && f.id != field.id) {
        return Err(ValidationError::invalid_value(
            &field.name,
            "another field of the table already has this name",
        ));
    }
    Ok(())
}

impl std::fmt::Debug for FieldService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldService").finish_non_exhaustive()
    }
}
