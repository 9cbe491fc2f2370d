//! Per-Table Field Cache
//!
//! Memoizes `FieldStore::find_by_table_id` so that every record mutation does
//! not re-read the table's field definitions. Entries are dropped by the
//! cache-invalidation event handler when a field event for the table commits.
//!
//! Only field definitions are cached. The dependency graph is rebuilt from
//! them on every calculation.
//!
//! # Invalidation races
//!
//! A load that started before an invalidation must not repopulate the cache
//! with what it read. Each invalidation bumps a generation counter and a load
//! only stores its result if the generation is unchanged.

use crate::db::{FieldStore, StoreError};
use crate::models::Field;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldCacheStats {
    pub tables: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct FieldCache {
    store: Arc<dyn FieldStore>,
    entries: RwLock<HashMap<String, Arc<Vec<Field>>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FieldCache {
    pub fn new(store: Arc<dyn FieldStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fields of `table_id` in definition order
    pub async fn get(&self, table_id: &str) -> Result<Arc<Vec<Field>>, StoreError> {
        if let Some(fields) = self.entries.read().await.get(table_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(fields.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::SeqCst);
        let fields = Arc::new(self.store.find_by_table_id(table_id).await?);

        let mut entries = self.entries.write().await;
        if self.generation.load(Ordering::SeqCst) == generation {
            entries.insert(table_id.to_string(), fields.clone());
        } else {
            tracing::trace!("Discarding field load for table {} raced by invalidation", table_id);
        }
        Ok(fields)
    }

    pub async fn invalidate(&self, table_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.entries.write().await.remove(table_id).is_some() {
            tracing::debug!("Invalidated field cache for table {}", table_id);
        }
    }

    pub async fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.write().await.clear();
        tracing::debug!("Invalidated field cache for all tables");
    }

    pub async fn stats(&self) -> FieldCacheStats {
        FieldCacheStats {
            tables: self.entries.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.generation.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for FieldCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCache")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}
