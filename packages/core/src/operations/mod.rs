//! Concurrency Operations
//!
//! Supporting machinery for fanning calculation work out across tasks.

mod error;
pub mod worker_pool;

pub use error::PoolError;
pub use worker_pool::{CancellationSignal, WorkerPool};
