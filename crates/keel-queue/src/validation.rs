//! Configuration validation.
//!
//! Every check runs and all problems are reported together, so a bad
//! config file is fixed in one pass instead of one error at a time.

use crate::config::QueueConfig;
use keel_core::KeelError;
use thiserror::Error;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    /// Queue name is empty.
    #[error("queue name must not be empty")]
    EmptyName,

    /// At least one job must be allowed in flight.
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    /// Interval or timeout value must be positive.
    #[error("'{name}' must be positive, got 0")]
    NonPositiveInterval { name: &'static str },

    /// Store path is empty.
    #[error("store path must not be empty")]
    EmptyStorePath,

    /// Store pool must hold at least one connection.
    #[error("store max_connections must be at least 1")]
    ZeroPoolSize,

    /// Event channel needs room for at least one event.
    #[error("event_capacity must be at least 1")]
    ZeroEventCapacity,
}

/// Runs every check, returning all failures.
pub fn validate(config: &QueueConfig) -> Result<(), Vec<ConfigValidationError>> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ConfigValidationError::EmptyName);
    }
    if config.concurrency == 0 {
        errors.push(ConfigValidationError::ZeroConcurrency);
    }
    if config.poll_interval_ms == 0 {
        errors.push(ConfigValidationError::NonPositiveInterval { name: "poll_interval_ms" });
    }
    if config.handler_timeout_secs == 0 {
        errors.push(ConfigValidationError::NonPositiveInterval { name: "handler_timeout_secs" });
    }
    if config.store.path.as_os_str().is_empty() {
        errors.push(ConfigValidationError::EmptyStorePath);
    }
    if config.store.max_connections == 0 {
        errors.push(ConfigValidationError::ZeroPoolSize);
    }
    if config.event_capacity == 0 {
        errors.push(ConfigValidationError::ZeroEventCapacity);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Folds a list of validation failures into one configuration error.
pub(crate) fn into_keel_error(errors: Vec<ConfigValidationError>) -> KeelError {
    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    KeelError::configuration(message)
}
