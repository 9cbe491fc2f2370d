//! Engine Configuration
//!
//! Every knob has a default, so `EngineConfig::default()` is a working
//! configuration. [`EngineConfig::from_env`] overlays `GRIDBASE_*` variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `GRIDBASE_WORKER_POOL_SIZE` | `worker_pool_size` |
//! | `GRIDBASE_PARALLEL_THRESHOLD` | `parallel_threshold` |
//! | `GRIDBASE_TRANSACTION_TIMEOUT_MS` | `transaction_timeout_ms` |
//! | `GRIDBASE_MAX_RETRIES` | `max_retries` |
//! | `GRIDBASE_RETRY_BASE_DELAY_MS` | `retry_base_delay_ms` |
//! | `GRIDBASE_HANDLER_MAX_RETRIES` | `handler_max_retries` |
//! | `GRIDBASE_HANDLER_RETRY_DELAY_MS` | `handler_retry_delay_ms` |
//! | `GRIDBASE_DEFAULT_TIMEZONE` | `default_timezone` |
//! | `GRIDBASE_EVENT_CHANNEL_CAPACITY` | `event_channel_capacity` |

use crate::db::TransactionOptions;
use crate::services::EngineError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Concurrent calculators per evaluation level
    pub worker_pool_size: usize,

    /// Minimum level size before calculators fan out to the pool
    pub parallel_threshold: usize,

    pub transaction_timeout_ms: u64,
    pub max_retries: u32,

    /// First retry delay; doubles on every further retry
    pub retry_base_delay_ms: u64,

    pub handler_max_retries: u32,
    pub handler_retry_delay_ms: u64,

    /// Timezone handed to formulas without their own
    pub default_timezone: String,

    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            parallel_threshold: 2,
            transaction_timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 10,
            handler_max_retries: 3,
            handler_retry_delay_ms: 50,
            default_timezone: "UTC".to_string(),
            event_channel_capacity: 128,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `GRIDBASE_*` environment variables
    ///
    /// Unparseable values keep the default and log a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        overlay(&lookup, "GRIDBASE_WORKER_POOL_SIZE", &mut config.worker_pool_size);
        overlay(&lookup, "GRIDBASE_PARALLEL_THRESHOLD", &mut config.parallel_threshold);
        overlay(&lookup, "GRIDBASE_TRANSACTION_TIMEOUT_MS", &mut config.transaction_timeout_ms);
        overlay(&lookup, "GRIDBASE_MAX_RETRIES", &mut config.max_retries);
        overlay(&lookup, "GRIDBASE_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms);
        overlay(&lookup, "GRIDBASE_HANDLER_MAX_RETRIES", &mut config.handler_max_retries);
        overlay(&lookup, "GRIDBASE_HANDLER_RETRY_DELAY_MS", &mut config.handler_retry_delay_ms);
        overlay(&lookup, "GRIDBASE_EVENT_CHANNEL_CAPACITY", &mut config.event_channel_capacity);
        if let Some(timezone) = lookup("GRIDBASE_DEFAULT_TIMEZONE") {
            config.default_timezone = timezone;
        }

        config
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.worker_pool_size == 0 {
            return Err(EngineError::Configuration("worker_pool_size must be at least 1".into()));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(EngineError::Configuration("transaction_timeout_ms must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(EngineError::Configuration("event_channel_capacity must be at least 1".into()));
        }
        if self.default_timezone.trim().is_empty() {
            return Err(EngineError::Configuration("default_timezone cannot be empty".into()));
        }
        Ok(())
    }

    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            timeout: Duration::from_millis(self.transaction_timeout_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn handler_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handler_retry_delay_ms)
    }
}

fn overlay<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw),
    }
}
