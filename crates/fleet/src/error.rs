//! Error types for fleet operations

use messenger::ClientError;

/// Errors from fleet operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform rejected the worker's credential. Leads to failover.
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),

    /// Network or platform hiccup. Never changes credential state.
    #[error("transient platform error: {0}")]
    Transient(String),

    #[error("pool exhausted: no free credential")]
    PoolExhausted,

    #[error("worker not found: {0}")]
    WorkerNotFound(u64),

    /// The requested operation is not valid in the worker's current state
    /// (for example a stop while a failover is in flight).
    #[error("worker {id} is {state}")]
    InvalidState { id: u64, state: &'static str },

    #[error("persistence error: {0}")]
    Persistence(#[from] fleet_store::Error),
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unauthorized(msg) => Error::CredentialInvalid(msg),
            ClientError::Transient(msg) => Error::Transient(msg),
        }
    }
}

/// Result alias for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;
