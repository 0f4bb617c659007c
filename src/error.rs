// src/error.rs
// Standardized error types for the braid store

use thiserror::Error;

/// Main error type for the braid library.
///
/// Callers discriminate on the variant, never on message text: `NotFound`
/// for missing entities, `Conflict` for uniqueness or state-machine
/// violations, `Validation` for bad input, `Producer` for an upstream
/// source failing mid-persist, and `Db`/`Json`/`Io` for storage faults.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("producer failure: {0}")]
    Producer(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Build a `NotFound` for an entity kind and id.
    pub fn not_found(kind: &str, id: &str) -> Self {
        StoreError::NotFound(format!("{kind} '{id}'"))
    }

    /// True when the error is a uniqueness/state precondition violation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// True when the error is a missing-entity error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        StoreError::Other(s)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            StoreError::Cancelled
        } else {
            StoreError::Other(err.to_string())
        }
    }
}

/// Check whether a rusqlite error is a UNIQUE or PRIMARY KEY violation.
///
/// Used by create paths to surface id collisions as `Conflict` instead of
/// an opaque `Db` error.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::ConstraintViolation,
                extended_code: ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY,
            },
            _,
        )
    )
}
