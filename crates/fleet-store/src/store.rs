//! JSON state file manager
//!
//! The whole state lives in memory behind a tokio Mutex and is mirrored to a
//! single JSON file. Mutations are applied to a copy, the copy is written
//! atomically (temp file + rename), and only then swapped in, so a failed
//! write is reported to the caller without corrupting either side. Calls
//! that change nothing skip the write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    BroadcastLog, Credential, CredentialStatus, KnownUser, SentMessage, WorkerRecord,
};

/// Everything persisted, as written to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct FleetState {
    #[serde(default)]
    next_credential_id: u64,
    #[serde(default)]
    next_worker_id: u64,
    #[serde(default)]
    credentials: BTreeMap<u64, Credential>,
    #[serde(default)]
    workers: BTreeMap<u64, WorkerRecord>,
    #[serde(default)]
    known_users: Vec<KnownUser>,
    #[serde(default)]
    sent_messages: Vec<SentMessage>,
    #[serde(default)]
    broadcasts: Vec<BroadcastLog>,
}

impl FleetState {
    fn allocate_credential_id(&mut self) -> u64 {
        let floor = self.credentials.keys().next_back().map_or(1, |max| max + 1);
        let id = self.next_credential_id.max(floor);
        self.next_credential_id = id + 1;
        id
    }

    fn allocate_worker_id(&mut self) -> u64 {
        let floor = self.workers.keys().next_back().map_or(1, |max| max + 1);
        let id = self.next_worker_id.max(floor);
        self.next_worker_id = id + 1;
        id
    }
}

/// Granularity of `KnownUser::last_seen` updates.
pub const LAST_SEEN_RESOLUTION_MS: u64 = 60_000;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Thread-safe fleet state manager.
pub struct FleetStore {
    path: PathBuf,
    state: Mutex<FleetState>,
}

impl FleetStore {
    /// Load state from the given file path.
    ///
    /// If the file doesn't exist, creates it with an empty state (cold start
    /// with no credentials and no workers).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading state file: {e}")))?;
            let state: FleetState = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing state file: {e}")))?;
            info!(
                path = %path.display(),
                credentials = state.credentials.len(),
                workers = state.workers.len(),
                "loaded fleet state"
            );
            state
        } else {
            info!(path = %path.display(), "state file not found, starting with empty fleet");
            let state = FleetState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `f` to a copy of the state and commit it if anything changed.
    async fn mutate<R>(&self, f: impl FnOnce(&mut FleetState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        if next != *state {
            write_atomic(&self.path, &next).await?;
            *state = next;
        }
        Ok(out)
    }

    // --- Credentials ---

    /// All credentials ordered by id.
    pub async fn load_credentials(&self) -> Vec<Credential> {
        let state = self.state.lock().await;
        state.credentials.values().cloned().collect()
    }

    pub async fn credential(&self, id: u64) -> Option<Credential> {
        let state = self.state.lock().await;
        state.credentials.get(&id).cloned()
    }

    /// Insert new `Free` credentials.
    ///
    /// Secrets already stored, or repeated within the batch, are returned in
    /// the rejected list; the rest of the batch is committed.
    pub async fn insert_credentials(&self, secrets: Vec<String>) -> Result<(Vec<u64>, Vec<String>)> {
        self.mutate(|state| {
            let mut added = Vec::new();
            let mut rejected = Vec::new();
            for secret in secrets {
                if state.credentials.values().any(|c| c.secret == secret) {
                    rejected.push(secret);
                    continue;
                }
                let id = state.allocate_credential_id();
                state.credentials.insert(
                    id,
                    Credential {
                        id,
                        secret,
                        status: CredentialStatus::Free,
                        created_at: now_millis(),
                        note: None,
                    },
                );
                added.push(id);
            }
            debug!(added = added.len(), rejected = rejected.len(), "inserted credentials");
            Ok((added, rejected))
        })
        .await
    }

    /// Set a credential's status. Returns false (and writes nothing) if the
    /// id does not exist.
    pub async fn update_credential_status(&self, id: u64, status: CredentialStatus) -> Result<bool> {
        self.mutate(|state| match state.credentials.get_mut(&id) {
            Some(credential) => {
                credential.status = status;
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    /// Delete credentials, skipping any that are `InUse`.
    ///
    /// Ids that do not exist count as deleted. Workers referencing a deleted
    /// credential have their reference nulled.
    pub async fn delete_credentials(&self, ids: &[u64]) -> Result<(Vec<u64>, Vec<u64>)> {
        self.mutate(|state| {
            let mut deleted = Vec::new();
            let mut skipped = Vec::new();
            for &id in ids {
                if deleted.contains(&id) || skipped.contains(&id) {
                    continue;
                }
                match state.credentials.get(&id) {
                    Some(c) if c.status == CredentialStatus::InUse => skipped.push(id),
                    _ => {
                        state.credentials.remove(&id);
                        for worker in state.workers.values_mut() {
                            if worker.credential_id == Some(id) {
                                worker.credential_id = None;
                            }
                        }
                        deleted.push(id);
                    }
                }
            }
            Ok((deleted, skipped))
        })
        .await
    }

    // --- Workers ---

    /// Create a worker bound to a `Free` credential, marking it `InUse` in the
    /// same commit.
    pub async fn insert_worker(&self, credential_id: u64) -> Result<WorkerRecord> {
        self.mutate(|state| {
            let credential = state
                .credentials
                .get_mut(&credential_id)
                .ok_or_else(|| Error::NotFound(format!("credential {credential_id}")))?;
            if credential.status != CredentialStatus::Free {
                return Err(Error::Conflict(format!(
                    "credential {credential_id} is {}",
                    credential.status.label()
                )));
            }
            credential.status = CredentialStatus::InUse;

            let id = state.allocate_worker_id();
            let record = WorkerRecord {
                id,
                credential_id: Some(credential_id),
                display_identity: None,
                link: None,
                is_running: false,
                last_error: None,
                created_at: now_millis(),
            };
            state.workers.insert(id, record.clone());
            Ok(record)
        })
        .await
    }

    /// Rebind a worker to a new credential, marking it `InUse` and recording
    /// the identity it resolved to, in one commit.
    pub async fn bind_worker(
        &self,
        worker_id: u64,
        credential_id: u64,
        display_identity: Option<String>,
        link: Option<String>,
    ) -> Result<WorkerRecord> {
        self.mutate(|state| {
            if !state.workers.contains_key(&worker_id) {
                return Err(Error::NotFound(format!("worker {worker_id}")));
            }
            let credential = state
                .credentials
                .get_mut(&credential_id)
                .ok_or_else(|| Error::NotFound(format!("credential {credential_id}")))?;
            credential.status = CredentialStatus::InUse;

            let record = state
                .workers
                .get_mut(&worker_id)
                .ok_or_else(|| Error::NotFound(format!("worker {worker_id}")))?;
            record.credential_id = Some(credential_id);
            record.display_identity = display_identity;
            record.link = link;
            record.last_error = None;
            Ok(record.clone())
        })
        .await
    }

    pub async fn load_worker_record(&self, id: u64) -> Option<WorkerRecord> {
        let state = self.state.lock().await;
        state.workers.get(&id).cloned()
    }

    /// All worker records ordered by id.
    pub async fn list_workers(&self) -> Vec<WorkerRecord> {
        let state = self.state.lock().await;
        state.workers.values().cloned().collect()
    }

    /// Update fields of a worker record and commit.
    pub async fn update_worker_record(
        &self,
        id: u64,
        f: impl FnOnce(&mut WorkerRecord),
    ) -> Result<WorkerRecord> {
        self.mutate(|state| {
            let record = state
                .workers
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
            f(record);
            Ok(record.clone())
        })
        .await
    }

    /// Delete a worker and everything it owns, returning its credential to
    /// `Free` if it was still bound and `InUse`.
    pub async fn delete_worker(&self, id: u64) -> Result<Option<WorkerRecord>> {
        self.mutate(|state| {
            let Some(record) = state.workers.remove(&id) else {
                return Ok(None);
            };
            if let Some(credential_id) = record.credential_id
                && let Some(credential) = state.credentials.get_mut(&credential_id)
                && credential.status == CredentialStatus::InUse
            {
                credential.status = CredentialStatus::Free;
            }
            state.known_users.retain(|u| u.worker_id != id);
            state.sent_messages.retain(|m| m.worker_id != id);
            debug!(worker_id = id, "deleted worker record");
            Ok(Some(record))
        })
        .await
    }

    // --- Users and messages ---

    pub async fn load_known_users(&self, worker_id: u64) -> Vec<KnownUser> {
        let state = self.state.lock().await;
        state
            .known_users
            .iter()
            .filter(|u| u.worker_id == worker_id)
            .cloned()
            .collect()
    }

    /// Record that `user_id` messaged `worker_id`. A repeat contact with an
    /// unchanged username writes nothing unless `last_seen` is older than
    /// `LAST_SEEN_RESOLUTION_MS`.
    pub async fn upsert_known_user(
        &self,
        worker_id: u64,
        user_id: i64,
        username: Option<String>,
    ) -> Result<()> {
        let now = now_millis();
        self.mutate(|state| {
            match state
                .known_users
                .iter_mut()
                .find(|u| u.worker_id == worker_id && u.user_id == user_id)
            {
                Some(user) => {
                    user.username = username;
                    if now.saturating_sub(user.last_seen) >= LAST_SEEN_RESOLUTION_MS {
                        user.last_seen = now;
                    }
                }
                None => state.known_users.push(KnownUser {
                    worker_id,
                    user_id,
                    username,
                    first_seen: now,
                    last_seen: now,
                }),
            }
            Ok(())
        })
        .await
    }

    pub async fn record_sent_message(
        &self,
        worker_id: u64,
        chat_id: i64,
        message_id: i64,
        kind: &str,
    ) -> Result<()> {
        self.mutate(|state| {
            state.sent_messages.push(SentMessage {
                worker_id,
                chat_id,
                message_id,
                kind: kind.to_string(),
                created_at: now_millis(),
            });
            Ok(())
        })
        .await
    }

    pub async fn sent_messages(&self, worker_id: u64, kind: &str) -> Vec<SentMessage> {
        let state = self.state.lock().await;
        state
            .sent_messages
            .iter()
            .filter(|m| m.worker_id == worker_id && m.kind == kind)
            .cloned()
            .collect()
    }

    // --- Broadcasts ---

    pub async fn record_broadcast(&self, log: BroadcastLog) -> Result<()> {
        self.mutate(|state| {
            state.broadcasts.push(log);
            Ok(())
        })
        .await
    }

    pub async fn broadcasts(&self) -> Vec<BroadcastLog> {
        let state = self.state.lock().await;
        state.broadcasts.clone()
    }
}

/// Write the state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bot tokens.
async fn write_atomic(path: &Path, state: &FleetState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("state path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".fleet-state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted fleet state");
    Ok(())
}
