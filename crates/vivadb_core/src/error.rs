//! Caller-facing error taxonomy and native error translation.
//!
//! Every native failure is translated at the point of the native call; raw
//! `NativeError` values never escape this crate.

use thiserror::Error;
use vivadb_interop::{NativeError, NativeErrorCode};

/// Result type for binding-layer operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors reported to callers of the binding layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// The caller passed something malformed: a bad filter, missing query
    /// arguments, an unmanaged handle where a managed one is required, or a
    /// type-mismatched aggregate.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was malformed.
        message: String,
    },

    /// The operation is not legal in the current state: the database is
    /// closed, a notification was requested inside a write transaction, or
    /// the handle has been deleted/invalidated.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the offending state.
        message: String,
    },
}

impl DbError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

/// Translates a native failure on the query path.
///
/// The original filter string is interpolated into the message whenever the
/// failure can be tied to one, so malformed-query failures are diagnosable
/// without engine internals leaking.
pub(crate) fn translate_query_error(filter: &str, err: NativeError) -> DbError {
    match err.code {
        NativeErrorCode::InvalidQueryString => {
            DbError::invalid_argument(format!("Wrong query string: {}", err.message))
        }
        NativeErrorCode::InvalidQuery => DbError::invalid_argument(format!(
            "Wrong query field or malformed syntax for query '{filter}': {}",
            err.message
        )),
        NativeErrorCode::IndexOutOfBounds => DbError::invalid_argument(format!(
            "Have you specified all parameters for query '{filter}'?: {}",
            err.message
        )),
        NativeErrorCode::InvalidHandle => DbError::invalid_state(err.message),
        NativeErrorCode::Other => DbError::invalid_argument(format!(
            "Invalid syntax for query '{filter}': {}",
            err.message
        )),
    }
}

/// Translates a native failure outside the query path.
///
/// Handle/state problems become `InvalidState`; anything the caller could
/// have malformed becomes `InvalidArgument`.
pub(crate) fn translate_native(err: NativeError) -> DbError {
    match err.code {
        NativeErrorCode::InvalidHandle | NativeErrorCode::Other => {
            DbError::invalid_state(err.message)
        }
        NativeErrorCode::InvalidQueryString
        | NativeErrorCode::InvalidQuery
        | NativeErrorCode::IndexOutOfBounds => DbError::invalid_argument(err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_query_string() {
        let err = translate_query_error(
            "name ~ 1",
            NativeError::invalid_query_string("unexpected character '~'"),
        );
        assert_eq!(
            err,
            DbError::invalid_argument("Wrong query string: unexpected character '~'")
        );
    }

    #[test]
    fn wrong_query_field() {
        let err = translate_query_error(
            "name == 42",
            NativeError::invalid_query("cannot compare field 'name' of type string with 42"),
        );
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.starts_with("Wrong query field or malformed syntax for query 'name == 42'"));
        assert!(message.contains("'name'"));
    }

    #[test]
    fn missing_parameters() {
        let err = translate_query_error(
            "name == $0",
            NativeError::index_out_of_bounds("no argument at index 0"),
        );
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.starts_with("Have you specified all parameters for query 'name == $0'?"));
    }

    #[test]
    fn generic_query_error() {
        let err = translate_query_error("age > 1", NativeError::other("boom"));
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.starts_with("Invalid syntax for query 'age > 1'"));
    }

    #[test]
    fn handle_errors_become_invalid_state() {
        let err = translate_native(NativeError::invalid_handle("db:1 is closed"));
        assert_eq!(err, DbError::invalid_state("db:1 is closed"));
    }
}
