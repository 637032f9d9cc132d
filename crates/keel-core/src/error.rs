//! Unified error type for the queue engine and its store.

use thiserror::Error;

/// Unified error type for keel.
///
/// Handler outcomes are not errors; they are reported through
/// [`JobOutcome`](crate::JobOutcome). This enum covers what can go wrong
/// around them: bad input, storage faults, and configuration.
#[derive(Error, Debug)]
pub enum KeelError {
    /// Caller input was rejected before touching the store.
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O or corruption in the persistent store.
    #[error("Storage fault: {0}")]
    Storage(String),

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeelError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Storage(_) => "STORAGE_FAULT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a storage fault.
    #[must_use]
    pub fn storage<T: Into<String>>(message: T) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if this error originated in the store.
    #[must_use]
    pub const fn is_storage_fault(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for KeelError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Storage(format!("corrupt record: {}", err))
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::migrate::MigrateError> for KeelError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
