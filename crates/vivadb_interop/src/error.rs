//! The closed error taxonomy the engine reports from.

use thiserror::Error;

/// Result type for engine boundary calls.
pub type NativeResult<T> = Result<T, NativeError>;

/// Error kind reported by the engine.
///
/// This is a closed set: the binding layer translates every kind into its
/// caller-facing taxonomy and must never see anything outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeErrorCode {
    /// The filter string could not be lexed at all.
    InvalidQueryString,
    /// The query references an unknown field, mismatched type, or has
    /// malformed syntax.
    InvalidQuery,
    /// A positional argument index has no bound argument.
    IndexOutOfBounds,
    /// A handle was used after its owning database closed, or after the
    /// underlying row was deleted.
    InvalidHandle,
    /// Any other engine failure.
    Other,
}

/// An error reported across the engine boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("native error [{code:?}]: {message}")]
pub struct NativeError {
    /// Error kind from the closed taxonomy.
    pub code: NativeErrorCode,
    /// Engine-supplied diagnostic message.
    pub message: String,
}

impl NativeError {
    /// Creates a native error.
    pub fn new(code: NativeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an invalid-query-string error.
    pub fn invalid_query_string(message: impl Into<String>) -> Self {
        Self::new(NativeErrorCode::InvalidQueryString, message)
    }

    /// Creates an invalid-query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(NativeErrorCode::InvalidQuery, message)
    }

    /// Creates an index-out-of-bounds error.
    pub fn index_out_of_bounds(message: impl Into<String>) -> Self {
        Self::new(NativeErrorCode::IndexOutOfBounds, message)
    }

    /// Creates an invalid-handle error.
    pub fn invalid_handle(message: impl Into<String>) -> Self {
        Self::new(NativeErrorCode::InvalidHandle, message)
    }

    /// Creates a generic engine error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(NativeErrorCode::Other, message)
    }
}
