//! Persisted records

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a pool credential.
///
/// - Free → InUse (bound to a worker)
/// - InUse → Free (worker deleted)
/// - InUse → Banned (platform revoked it while bound)
/// - Free → Dead (rejected when probed as a failover candidate)
///
/// Banned and Dead are terminal; such credentials are never drawn again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Free,
    InUse,
    Banned,
    Dead,
}

impl CredentialStatus {
    /// Status label for health/logging/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Free => "free",
            CredentialStatus::InUse => "in_use",
            CredentialStatus::Banned => "banned",
            CredentialStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CredentialStatus::Banned | CredentialStatus::Dead)
    }
}

/// A bot token in the pool. `secret` never leaves the process except in
/// platform requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    pub secret: String,
    pub status: CredentialStatus,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Durable view of one worker. `is_running` is what was last recorded; the
/// in-memory registry decides whether the worker is actually executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: u64,
    /// Nulled when the bound credential is deleted from the pool
    pub credential_id: Option<u64>,
    /// Platform username of the bound bot
    #[serde(default)]
    pub display_identity: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
}

/// A user a worker has received a message from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownUser {
    pub worker_id: u64,
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub first_seen: u64,
    /// Refreshed at most once per `LAST_SEEN_RESOLUTION_MS`
    #[serde(default)]
    pub last_seen: u64,
}

/// Kind tag for greeting messages, the only kind edited after sending.
pub const GREETING_KIND: &str = "greeting";

/// A message a worker sent that may be edited later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub worker_id: u64,
    pub chat_id: i64,
    pub message_id: i64,
    pub kind: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    General,
    Migration,
}

/// Outcome of one completed broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastLog {
    pub id: Uuid,
    pub kind: BroadcastKind,
    pub text: String,
    #[serde(default)]
    pub photo_path: Option<String>,
    pub total: u64,
    pub ok: u64,
    pub fail: u64,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&CredentialStatus::InUse).unwrap();
        assert_eq!(json, "\"in_use\"");
        let parsed: CredentialStatus = serde_json::from_str("\"banned\"").unwrap();
        assert_eq!(parsed, CredentialStatus::Banned);
    }

    #[test]
    fn only_banned_and_dead_are_terminal() {
        assert!(CredentialStatus::Banned.is_terminal());
        assert!(CredentialStatus::Dead.is_terminal());
        assert!(!CredentialStatus::Free.is_terminal());
        assert!(!CredentialStatus::InUse.is_terminal());
    }

    #[test]
    fn worker_record_tolerates_missing_optional_fields() {
        let record: WorkerRecord =
            serde_json::from_str(r#"{"id": 3, "credential_id": null, "created_at": 0}"#).unwrap();
        assert_eq!(record.id, 3);
        assert!(!record.is_running);
        assert!(record.last_error.is_none());
    }
}
