//! Error types for persistence operations

/// Errors from the fleet store.
///
/// `Io` and `Parse` mean the store is unavailable; callers propagate them
/// rather than retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("state file parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
