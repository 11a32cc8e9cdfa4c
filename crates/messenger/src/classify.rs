//! Platform error classification
//!
//! Only a rejected credential may trigger failover. The Bot API answers 401
//! for a revoked token and 404 for a token that never existed (the method
//! path is unknown). Every other status, including 403 "bot was blocked by
//! the user" and 429 flood control, concerns a single request or chat and is
//! treated as transient.

/// Failure class of a platform response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credential revoked or unknown; replace it.
    Unauthorized,
    /// Retry later; the credential stays valid.
    Transient,
}

/// Classify a non-success platform status code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 404 => ErrorKind::Unauthorized,
        _ => ErrorKind::Transient,
    }
}
