//! Bounded worker pool with cooperative cancellation
//!
//! Runs a batch of independent jobs on spawned tasks, never more than `size`
//! at a time. Results come back in job order.
//!
//! Cancellation is cooperative: a fired [`CancellationSignal`] (or a passed
//! deadline) stops jobs that have not started yet, aborts in-flight tasks and
//! makes [`WorkerPool::run_all`] return the first recorded error.
//!
//! # Example
//!
//! ```rust
//! use gridbase_core::operations::{CancellationSignal, WorkerPool};
//!
//! # tokio_test::block_on(async {
//! let pool = WorkerPool::new(4);
//! let jobs: Vec<_> = (1..=3).map(|n| move || async move { n * 10 }).collect();
//! let results = pool.run_all(jobs, &CancellationSignal::new(), None).await.unwrap();
//! assert_eq!(results, vec![10, 20, 30]);
//! # });
//! ```

use super::PoolError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Shared cancellation flag
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Fixed-size pool for fanning out independent jobs
#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// A pool running at most `size` jobs concurrently (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run every job and collect the results in job order
    ///
    /// # Arguments
    ///
    /// * `jobs` - Independent jobs; none may depend on another's result
    /// * `cancel` - Fired by the caller to stop the batch; also fired by the
    ///   pool itself when a job fails or the deadline passes
    /// * `deadline` - Optional instant after which the batch is abandoned
    pub async fn run_all<T, F, Fut>(
        &self,
        jobs: Vec<F>,
        cancel: &CancellationSignal,
        deadline: Option<Instant>,
    ) -> Result<Vec<T>, PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let total = jobs.len();
        let mut tasks = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let permits = self.permits.clone();
            let signal = cancel.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if signal.is_cancelled() {
                    return None;
                }
                Some((index, job().await))
            });
        }

        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Some((index, value)))) => results[index] = Some(value),
                    // Skipped after cancellation; reported once the batch drains
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Worker task failed: {}", e);
                        cancel.cancel();
                        tasks.abort_all();
                        return Err(PoolError::task_failed(e.to_string()));
                    }
                },
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(PoolError::Cancelled);
                }
                _ = &mut expired => {
                    tracing::warn!("Worker pool deadline exceeded with {} job(s) pending", tasks.len());
                    cancel.cancel();
                    tasks.abort_all();
                    return Err(PoolError::DeadlineExceeded);
                }
            }
        }

        results
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or(PoolError::Cancelled)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(10)
    }
}
