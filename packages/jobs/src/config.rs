//! Environment configuration for the thread pool.

use std::num::NonZeroUsize;

use moosicbox_env_utils::DefaultEnvUsizeError;

/// Number of worker threads a [`crate::ThreadpoolScheduler`] built from the
/// environment spawns.
pub const WORKER_THREADS_VAR: &str = "SWITCHY_JOBS_WORKER_THREADS";

/// Name prefix of the worker threads.
pub const THREAD_NAME_VAR: &str = "SWITCHY_JOBS_THREAD_NAME";

pub const DEFAULT_THREAD_NAME: &str = "switchy-jobs-worker";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    ParseInt {
        name: &'static str,
        source: DefaultEnvUsizeError,
    },
}

/// Reads a `usize` from the environment, falling back to `default` when the
/// variable is unset.
///
/// # Errors
///
/// * If the variable is set but is not a valid `usize`
pub fn default_env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    moosicbox_env_utils::default_env_usize(name, default)
        .map_err(|source| ConfigError::ParseInt { name, source })
}

/// Reads a string from the environment, falling back to `default` when the
/// variable is unset.
#[must_use]
pub fn default_env(name: &'static str, default: &str) -> String {
    moosicbox_env_utils::default_env(name, default)
}

/// Worker count used when none is configured: one per available core.
#[must_use]
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
