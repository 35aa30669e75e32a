use thiserror::Error;

/// Error taxonomy for the messaging store. Infrastructure failures stay in
/// the `Sqlite`/`Internal` variants; everything else is a domain outcome the
/// API layer maps to a status code.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or contradictory input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Actor lacks permission for the action
    #[error("not permitted: {0}")]
    Authorization(String),

    /// Duplicate active state (e.g. adding an already-active participant)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation invalid given the record's current lifecycle state
    #[error("invalid state: {0}")]
    State(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// True when the error is a constraint violation. Concurrent writers racing
/// on the same unique key land here; callers translate the loss into the
/// operation's idempotent outcome instead of propagating a raw storage error.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
