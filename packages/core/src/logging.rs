//! Tracing setup for binaries and tests embedding the engine

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or `default_filter` when unset
///
/// Returns `false` if a global subscriber was already installed, so tests may
/// call this repeatedly.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .try_init()
        .is_ok()
}
