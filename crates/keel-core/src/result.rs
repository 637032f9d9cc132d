//! Result type aliases for keel.

use crate::KeelError;

/// A specialized `Result` type for keel operations.
pub type KeelResult<T> = Result<T, KeelError>;
