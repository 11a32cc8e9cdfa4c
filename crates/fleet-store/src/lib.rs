//! Durable state for the bot fleet
//!
//! One JSON document holds the credential pool, worker records, the users
//! each worker has seen, messages that may later be edited, and the broadcast
//! log. Every mutating call commits to disk (temp file + rename) before it
//! returns; a failed write leaves both the file and the in-memory state
//! untouched.
//!
//! Compound operations that must not be observed half-done (binding a
//! credential to a worker, releasing it on delete) are single commits.

pub mod error;
pub mod models;
pub mod store;

pub use error::{Error, Result};
pub use models::{
    BroadcastKind, BroadcastLog, Credential, CredentialStatus, GREETING_KIND, KnownUser,
    SentMessage, WorkerRecord,
};
pub use store::{FleetStore, LAST_SEEN_RESOLUTION_MS, now_millis};
