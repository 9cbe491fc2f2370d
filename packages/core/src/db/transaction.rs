//! Transaction & Event Coordination
//!
//! A unit of work runs against a [`TransactionContext`]: it stages writes,
//! appends domain events and registers post-commit callbacks. Nothing becomes
//! visible until [`TransactionManager::run_in_transaction`] commits the staged
//! writes in one atomic batch. Only then are callbacks run and the
//! (deduplicated) events published.
//!
//! # Lifecycle
//!
//! 1. A fresh context is created per attempt
//! 2. The unit of work runs under the configured timeout
//! 3. Staged writes are committed through the [`TransactionProvider`]
//! 4. A detached task runs the callbacks, then publishes the events
//!
//! A failed attempt drops its context, which discards writes, events and
//! callbacks together. Contention failures (from the unit of work or from the
//! commit) restart the whole unit of work with exponential backoff.
//!
//! # Nesting
//!
//! Passing the active context as `parent` runs the closure directly against
//! it. There is no inner commit: the outermost boundary owns the writes.
//!
//! # Cancellation
//!
//! The timeout only covers the unit of work, never the commit. Post-commit
//! work is spawned before it is awaited, so it runs to completion even if the
//! caller's future is dropped after the commit.

use super::events::{dedup_events, DomainEvent};
use super::store::TransactionProvider;
use crate::models::{Field, FieldId, Record, RecordId};
use crate::services::EngineError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Future returned by a unit of work borrowing its context for `'a`
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type PostCommitCallback = Box<dyn FnOnce() -> CallbackFuture + Send + Sync + 'static>;

/// Receives the committed events of each unit of work
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, events: Vec<DomainEvent>);
}

/// A write held back until commit
#[derive(Debug, Clone, PartialEq)]
pub enum StagedWrite {
    /// `expected_version` is the stored version this write replaces; `None` inserts
    SaveRecord {
        record: Record,
        expected_version: Option<i64>,
    },
    DeleteRecord {
        table_id: String,
        record_id: RecordId,
        expected_version: i64,
    },
    SaveField(Field),
    DeleteField { field_id: FieldId },
    SetFieldError { field_id: FieldId, has_error: bool },
    /// Provision the physical column of a stored field
    AddColumn { table_id: String, field_id: FieldId },
    /// Fails the commit with contention unless the table's field definitions
    /// are still at `revision`
    AssertFieldRevision { table_id: String, revision: u64 },
}

/// State owned by one unit of work
pub struct TransactionContext {
    id: String,
    attempt: u32,
    writes: Vec<StagedWrite>,
    events: Vec<DomainEvent>,
    callbacks: Vec<(Option<String>, PostCommitCallback)>,
}

impl TransactionContext {
    pub fn new(attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt,
            writes: Vec::new(),
            events: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Zero-based retry attempt this context belongs to
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn stage(&mut self, write: StagedWrite) {
        self.writes.push(write);
    }

    /// Stage a record save
    ///
    /// Saving a record already staged in this unit of work replaces the staged
    /// copy but keeps the first `expected_version`, so commit still checks
    /// against the version that was read from the store.
    pub fn stage_record(&mut self, record: Record, expected_version: Option<i64>) {
        for write in self.writes.iter_mut() {
            if let StagedWrite::SaveRecord { record: staged, .. } = write {
                if staged.id == record.id && staged.table_id == record.table_id {
                    *staged = record;
                    return;
                }
            }
        }
        self.writes.push(StagedWrite::SaveRecord {
            record,
            expected_version,
        });
    }

    /// Stage a record deletion, dropping any staged save of the same record
    pub fn stage_delete(&mut self, table_id: &str, record_id: &str, expected_version: i64) {
        let mut staged_insert = false;
        self.writes.retain(|write| match write {
            StagedWrite::SaveRecord {
                record,
                expected_version,
            } if record.id == record_id && record.table_id == table_id => {
                staged_insert = expected_version.is_none();
                false
            }
            _ => true,
        });
        // Deleting a record inserted in this same unit of work leaves nothing to commit
        if !staged_insert {
            self.writes.push(StagedWrite::DeleteRecord {
                table_id: table_id.to_string(),
                record_id: record_id.to_string(),
                expected_version,
            });
        }
    }

    /// Guard the commit against concurrent changes to a table's fields
    ///
    /// Only the first revision read per table is kept, so every definition
    /// change staged in this unit of work is checked against the same snapshot.
    pub fn assert_field_revision(&mut self, table_id: &str, revision: u64) {
        let staged = self.writes.iter().any(
            |write| matches!(write, StagedWrite::AssertFieldRevision { table_id: t, .. } if t == table_id),
        );
        if !staged {
            self.writes.push(StagedWrite::AssertFieldRevision {
                table_id: table_id.to_string(),
                revision,
            });
        }
    }

    /// Stage a field's error flag; the last flag per field wins
    pub fn stage_field_error(&mut self, field_id: &str, has_error: bool) {
        self.writes.retain(
            |write| !matches!(write, StagedWrite::SetFieldError { field_id: id, .. } if id == field_id),
        );
        self.writes.push(StagedWrite::SetFieldError {
            field_id: field_id.to_string(),
            has_error,
        });
    }

    /// Staged copy of a record, for read-your-writes inside the unit of work
    pub fn staged_record(&self, table_id: &str, record_id: &str) -> Option<&Record> {
        self.writes.iter().find_map(|write| match write {
            StagedWrite::SaveRecord { record, .. }
                if record.id == record_id && record.table_id == table_id =>
            {
                Some(record)
            }
            _ => None,
        })
    }

    /// Version the staged save of a record was read at
    pub fn staged_expected_version(&self, table_id: &str, record_id: &str) -> Option<Option<i64>> {
        self.writes.iter().find_map(|write| match write {
            StagedWrite::SaveRecord {
                record,
                expected_version,
            } if record.id == record_id && record.table_id == table_id => Some(*expected_version),
            _ => None,
        })
    }

    /// Whether the record is inserted by this unit of work
    pub fn is_staged_insert(&self, table_id: &str, record_id: &str) -> bool {
        self.staged_expected_version(table_id, record_id) == Some(None)
    }

    pub fn is_deleted(&self, table_id: &str, record_id: &str) -> bool {
        self.writes.iter().any(|write| {
            matches!(write, StagedWrite::DeleteRecord { table_id: t, record_id: r, .. }
                if t == table_id && r == record_id)
        })
    }

    pub fn staged_writes(&self) -> &[StagedWrite] {
        &self.writes
    }

    pub fn add_event(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    /// Run `callback` after a successful commit
    pub fn on_commit<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks
            .push((None, Box::new(move || Box::pin(callback()) as CallbackFuture)));
    }

    /// Like [`on_commit`](Self::on_commit), but a later callback with the same
    /// key replaces the earlier one
    pub fn on_commit_keyed<F, Fut>(&mut self, key: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        self.callbacks
            .retain(|(existing, _)| existing.as_deref() != Some(key.as_str()));
        self.callbacks
            .push((Some(key), Box::new(move || Box::pin(callback()) as CallbackFuture)));
    }

    /// Drop the keyed callback registered under `key`, if any
    pub fn cancel_on_commit(&mut self, key: &str) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| existing.as_deref() != Some(key));
        self.callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    fn into_parts(self) -> (Vec<StagedWrite>, Vec<DomainEvent>, Vec<PostCommitCallback>) {
        let callbacks = self.callbacks.into_iter().map(|(_, cb)| cb).collect();
        (self.writes, self.events, callbacks)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("writes", &self.writes.len())
            .field("events", &self.events.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Timeout and retry policy of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub timeout: Duration,

    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,

    /// Base delay; doubles on every retry
    pub retry_delay: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        }
    }
}

impl TransactionOptions {
    /// Delay before retry number `attempt + 1`: base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Runs units of work atomically with retry on contention
#[derive(Clone)]
pub struct TransactionManager {
    provider: Arc<dyn TransactionProvider>,
    publisher: Option<Arc<dyn EventPublisher>>,
    defaults: TransactionOptions,
}

impl TransactionManager {
    pub fn new(provider: Arc<dyn TransactionProvider>, defaults: TransactionOptions) -> Self {
        Self {
            provider,
            publisher: None,
            defaults,
        }
    }

    /// Publish committed events through `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn defaults(&self) -> TransactionOptions {
        self.defaults
    }

    /// Run `work` as one atomic unit of work
    ///
    /// # Arguments
    ///
    /// * `parent` - Active context of an enclosing unit of work, if any
    /// * `options` - Overrides the manager's default timeout and retry policy
    /// * `work` - Called once per attempt with a fresh context
    ///
    /// # Errors
    ///
    /// - `EngineError::Timeout` if an attempt exceeds the timeout (not retried)
    /// - `EngineError::RetryBudgetExhausted` once contention outlasts `max_retries`
    /// - Any other error from `work` or the commit, unchanged and without retry
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use gridbase_core::db::TransactionManager;
    /// # async fn example(manager: TransactionManager) -> Result<(), gridbase_core::EngineError> {
    /// let id = manager
    ///     .run_in_transaction(None, None, |tx| {
    ///         Box::pin(async move {
    ///             tx.on_commit(|| async { tracing::info!("committed") });
    ///             Ok(tx.id().to_string())
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_in_transaction<T, F>(
        &self,
        parent: Option<&mut TransactionContext>,
        options: Option<TransactionOptions>,
        mut work: F,
    ) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut TransactionContext) -> TxFuture<'a, T> + Send,
    {
        if let Some(tx) = parent {
            return work(tx).await;
        }

        let options = options.unwrap_or(self.defaults);
        let mut attempt: u32 = 0;

        loop {
            let mut tx = TransactionContext::new(attempt);

            let outcome = match tokio::time::timeout(options.timeout, work(&mut tx)).await {
                Ok(Ok(value)) => self.commit(tx).await.map(|_| value),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    tracing::warn!(
                        "Unit of work {} timed out after {:?}, rolled back",
                        tx.id(),
                        options.timeout
                    );
                    Err(EngineError::Timeout(options.timeout))
                }
            };

            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!("Unit of work committed after {} retry(ies)", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_contention() && attempt < options.max_retries => {
                    let delay = options.backoff(attempt);
                    tracing::debug!(
                        "Contention on attempt {}/{}: {}. Retrying in {:?}...",
                        attempt + 1,
                        options.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_contention() => {
                    tracing::warn!(
                        "Unit of work failed after {} attempt(s) due to persistent contention",
                        attempt + 1
                    );
                    return Err(EngineError::RetryBudgetExhausted {
                        attempts: attempt + 1,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit(&self, tx: TransactionContext) -> Result<(), EngineError> {
        let tx_id = tx.id.clone();
        let (writes, events, callbacks) = tx.into_parts();

        let write_count = writes.len();
        self.provider.commit(writes).await?;
        tracing::debug!("Committed unit of work {} ({} write(s))", tx_id, write_count);

        let events = dedup_events(events);
        if callbacks.is_empty() && (events.is_empty() || self.publisher.is_none()) {
            return Ok(());
        }

        let publisher = self.publisher.clone();
        let post_commit = tokio::spawn(async move {
            for callback in callbacks {
                callback().await;
            }
            if let Some(publisher) = publisher {
                if !events.is_empty() {
                    publisher.publish(events).await;
                }
            }
        });

        // Already committed: a failing post-commit task must not fail the caller
        if let Err(e) = post_commit.await {
            tracing::error!("Post-commit task for unit of work {} failed: {}", tx_id, e);
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("defaults", &self.defaults)
            .field("has_publisher", &self.publisher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StoreError};
    use crate::models::RecordData;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        batches: Mutex<Vec<Vec<DomainEvent>>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, events: Vec<DomainEvent>) {
            self.batches.lock().unwrap().push(events);
        }
    }

    fn fast_options(max_retries: u32) -> TransactionOptions {
        TransactionOptions {
            timeout: Duration::from_secs(5),
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn manager(store: Arc<MemoryStore>) -> (TransactionManager, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = TransactionManager::new(store, fast_options(3)).with_publisher(publisher.clone());
        (manager, publisher)
    }

    fn new_record(id: &str) -> Record {
        let mut record = Record::new("t1", RecordData::new().with("a", 1.0), "tester");
        record.id = id.to_string();
        record
    }

    #[tokio::test]
    async fn test_commit_runs_callbacks_then_publishes() {
        let store = Arc::new(MemoryStore::new());
        let (manager, publisher) = manager(store.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        manager
            .run_in_transaction(None, None, move |tx| {
                let flag = flag.clone();
                Box::pin(async move {
                    let record = new_record("r1");
                    tx.add_event(DomainEvent::record_created(&record));
                    tx.stage_record(record, None);
                    tx.on_commit(move || async move { flag.store(true, Ordering::SeqCst) });
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(publisher.batches.lock().unwrap().len(), 1);
        assert!(store.record("t1", "r1").await.is_some());
    }

    #[tokio::test]
    async fn test_failed_work_discards_everything() {
        let store = Arc::new(MemoryStore::new());
        let (manager, publisher) = manager(store.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let result: Result<(), EngineError> = manager
            .run_in_transaction(None, None, move |tx| {
                let flag = flag.clone();
                Box::pin(async move {
                    tx.stage_record(new_record("r1"), None);
                    tx.on_commit(move || async move { flag.store(true, Ordering::SeqCst) });
                    Err(EngineError::infrastructure("evaluator crashed"))
                })
            })
            .await;

        assert_eq!(result, Err(EngineError::infrastructure("evaluator crashed")));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert!(store.record("t1", "r1").await.is_none());
    }

    #[tokio::test]
    async fn test_contention_retries_whole_unit_of_work() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        store.fail_next_commits(2);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let attempt_seen = manager
            .run_in_transaction(None, None, move |tx| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.stage_record(new_record("r1"), None);
                    Ok(tx.attempt())
                })
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(attempt_seen, 2);
        assert!(store.record("t1", "r1").await.is_some());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let (manager, publisher) = manager(store.clone());
        store.fail_next_commits(10);

        let result = manager
            .run_in_transaction(None, Some(fast_options(2)), |tx| {
                Box::pin(async move {
                    tx.add_event(DomainEvent::record_created(&new_record("r1")));
                    tx.stage_record(new_record("r1"), None);
                    Ok(())
                })
            })
            .await;

        match result {
            Err(EngineError::RetryBudgetExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_contention());
            }
            other => panic!("Expected exhausted retries, got {:?}", other),
        }
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_contention_errors_are_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<(), EngineError> = manager
            .run_in_transaction(None, None, move |_tx| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::version_conflict("r1", 1, 2).into())
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_aborts_before_commit() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let options = TransactionOptions {
            timeout: Duration::from_millis(20),
            ..fast_options(0)
        };

        let result = manager
            .run_in_transaction(None, Some(options), |tx| {
                Box::pin(async move {
                    tx.stage_record(new_record("r1"), None);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
            })
            .await;

        assert_eq!(result, Err(EngineError::Timeout(Duration::from_millis(20))));
        assert!(store.record("t1", "r1").await.is_none());
    }

    #[tokio::test]
    async fn test_nested_call_reuses_parent_context() {
        let store = Arc::new(MemoryStore::new());
        let (manager, publisher) = manager(store.clone());

        let inner_manager = manager.clone();
        manager
            .run_in_transaction(None, None, move |tx| {
                let inner_manager = inner_manager.clone();
                Box::pin(async move {
                    let outer_id = tx.id().to_string();
                    let inner_id = inner_manager
                        .run_in_transaction(Some(&mut *tx), None, |inner| {
                            Box::pin(async move {
                                inner.stage_record(new_record("r1"), None);
                                inner.add_event(DomainEvent::record_created(&new_record("r1")));
                                Ok(inner.id().to_string())
                            })
                        })
                        .await?;
                    assert_eq!(inner_id, outer_id);
                    // Nothing committed until the outer boundary finishes
                    assert_eq!(tx.staged_writes().len(), 1);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(store.commit_count(), 1);
        assert_eq!(publisher.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_callbacks_run_once() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        manager
            .run_in_transaction(None, None, move |tx| {
                let counter = counter.clone();
                Box::pin(async move {
                    for _ in 0..3 {
                        let counter = counter.clone();
                        tx.on_commit_keyed("broadcast:t1:r1", move || async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                    assert_eq!(tx.callback_count(), 1);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_commit_survives_caller_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let run = manager.run_in_transaction(None, None, move |tx| {
            let flag = flag.clone();
            Box::pin(async move {
                tx.stage_record(new_record("r1"), None);
                tx.on_commit(move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                });
                Ok(())
            })
        });

        // Caller gives up while the callback is still sleeping
        let _ = tokio::time::timeout(Duration::from_millis(10), run).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.record("t1", "r1").await.is_some());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stage_record_keeps_first_expected_version() {
        let mut tx = TransactionContext::new(0);
        let mut record = new_record("r1");
        record.version = 2;
        tx.stage_record(record.clone(), Some(1));
        record.version = 3;
        tx.stage_record(record, Some(2));

        assert_eq!(tx.staged_writes().len(), 1);
        assert_eq!(tx.staged_expected_version("t1", "r1"), Some(Some(1)));
        assert_eq!(tx.staged_record("t1", "r1").map(|r| r.version), Some(3));
    }

    #[test]
    fn test_delete_of_staged_insert_cancels_out() {
        let mut tx = TransactionContext::new(0);
        tx.stage_record(new_record("r1"), None);
        tx.stage_delete("t1", "r1", 1);
        assert!(tx.staged_writes().is_empty());

        tx.stage_delete("t1", "r2", 4);
        assert!(tx.is_deleted("t1", "r2"));
    }

    #[test]
    fn test_context_can_be_shared_across_awaits() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransactionContext>();
    }

    #[test]
    fn test_cancel_keyed_callback() {
        let mut tx = TransactionContext::new(0);
        tx.on_commit_keyed("broadcast:t1:r1", || async {});
        tx.on_commit(|| async {});

        assert!(tx.cancel_on_commit("broadcast:t1:r1"));
        assert!(!tx.cancel_on_commit("broadcast:t1:r1"));
        assert_eq!(tx.callback_count(), 1);
    }

    #[test]
    fn test_first_field_revision_per_table_wins() {
        let mut tx = TransactionContext::new(0);
        tx.assert_field_revision("t1", 3);
        tx.assert_field_revision("t1", 4);
        tx.assert_field_revision("t2", 1);

        assert_eq!(
            tx.staged_writes(),
            &[
                StagedWrite::AssertFieldRevision {
                    table_id: "t1".into(),
                    revision: 3
                },
                StagedWrite::AssertFieldRevision {
                    table_id: "t2".into(),
                    revision: 1
                },
            ]
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let options = TransactionOptions::default();
        assert_eq!(options.backoff(0), Duration::from_millis(10));
        assert_eq!(options.backoff(1), Duration::from_millis(20));
        assert_eq!(options.backoff(2), Duration::from_millis(40));
    }
}
