//! Credential pool: draws, reservations, and status transitions
//!
//! The store is the single source of truth for credential status. The pool
//! adds an in-memory reservation set on top so that two failovers running
//! at the same time never probe the same candidate. A reservation lives
//! from `reserve_free` until the candidate is marked, bound, or released.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fleet_store::{Credential, CredentialStatus, FleetStore, WorkerRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Why a submitted secret was not added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Malformed,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub fingerprint: String,
    pub reason: RejectReason,
}

/// Result of a bulk insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    pub added: Vec<u64>,
    pub rejected: Vec<Rejected>,
}

/// Result of a bulk delete. `skipped` holds ids refused because they are in use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<u64>,
    pub skipped: Vec<u64>,
}

/// Short, stable identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..9])
}

/// Bot token shape: `<6-12 digits>:<30+ chars of [A-Za-z0-9_-]>`.
pub fn is_well_formed(secret: &str) -> bool {
    let Some((bot_id, key)) = secret.split_once(':') else {
        return false;
    };
    (6..=12).contains(&bot_id.len())
        && bot_id.bytes().all(|b| b.is_ascii_digit())
        && key.len() >= 30
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn record_transition(status: CredentialStatus) {
    metrics::counter!("fleet_credential_transitions_total", "status" => status.label())
        .increment(1);
}

/// Shared credential pool.
pub struct CredentialPool {
    store: Arc<FleetStore>,
    reserved: Mutex<HashSet<u64>>,
}

impl CredentialPool {
    pub fn new(store: Arc<FleetStore>) -> Self {
        Self {
            store,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// All credentials ordered by id.
    pub async fn credentials(&self) -> Vec<Credential> {
        self.store.load_credentials().await
    }

    /// Lowest-id `Free` credential that is not reserved.
    pub async fn draw_free(&self) -> Option<Credential> {
        let reserved = self.reserved.lock().await;
        self.first_free(&reserved, &HashSet::new()).await
    }

    /// Like `draw_free`, skipping `excluded`, and reserves the result under
    /// the same lock.
    pub async fn reserve_free(&self, excluded: &HashSet<u64>) -> Option<Credential> {
        let mut reserved = self.reserved.lock().await;
        let candidate = self.first_free(&reserved, excluded).await?;
        reserved.insert(candidate.id);
        debug!(credential_id = candidate.id, "reserved credential");
        Some(candidate)
    }

    async fn first_free(
        &self,
        reserved: &HashSet<u64>,
        excluded: &HashSet<u64>,
    ) -> Option<Credential> {
        self.store
            .load_credentials()
            .await
            .into_iter()
            .find(|c| {
                c.status == CredentialStatus::Free
                    && !reserved.contains(&c.id)
                    && !excluded.contains(&c.id)
            })
    }

    /// Drop a reservation without changing status.
    pub async fn release(&self, id: u64) {
        if self.reserved.lock().await.remove(&id) {
            debug!(credential_id = id, "released credential reservation");
        }
    }

    /// Set a credential's status and drop any reservation on it.
    ///
    /// Idempotent. Returns false for unknown ids.
    pub async fn mark(&self, id: u64, status: CredentialStatus) -> Result<bool> {
        let previous = self.store.credential(id).await.map(|c| c.status);
        let result = self.store.update_credential_status(id, status).await;
        self.release(id).await;
        let found = result?;
        if previous.is_some_and(|p| p != status) {
            record_transition(status);
            info!(credential_id = id, status = status.label(), "credential status changed");
        }
        Ok(found)
    }

    /// Create a worker record on a reserved `Free` credential. The
    /// credential becomes `InUse` in the same commit.
    pub async fn assign(&self, credential_id: u64) -> Result<WorkerRecord> {
        let result = self.store.insert_worker(credential_id).await;
        self.release(credential_id).await;
        let record = result?;
        record_transition(CredentialStatus::InUse);
        info!(
            worker_id = record.id,
            credential_id, "credential assigned to new worker"
        );
        Ok(record)
    }

    /// Rebind an existing worker to a reserved candidate in one commit.
    pub async fn bind(
        &self,
        worker_id: u64,
        credential_id: u64,
        display_identity: Option<String>,
        link: Option<String>,
    ) -> Result<WorkerRecord> {
        let result = self
            .store
            .bind_worker(worker_id, credential_id, display_identity, link)
            .await;
        self.release(credential_id).await;
        let record = result?;
        record_transition(CredentialStatus::InUse);
        info!(worker_id, credential_id, "credential bound to worker");
        Ok(record)
    }

    /// Add credentials from raw secrets. Blank entries are ignored; malformed
    /// and duplicate secrets are rejected without aborting the batch.
    pub async fn bulk_insert<S: AsRef<str>>(&self, secrets: &[S]) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        let mut candidates = Vec::new();
        for raw in secrets {
            let secret = raw.as_ref().trim();
            if secret.is_empty() {
                continue;
            }
            if is_well_formed(secret) {
                candidates.push(secret.to_string());
            } else {
                report.rejected.push(Rejected {
                    fingerprint: fingerprint(secret),
                    reason: RejectReason::Malformed,
                });
            }
        }

        let (added, duplicates) = self.store.insert_credentials(candidates).await?;
        report.added = added;
        report
            .rejected
            .extend(duplicates.iter().map(|secret| Rejected {
                fingerprint: fingerprint(secret),
                reason: RejectReason::Duplicate,
            }));

        info!(
            added = report.added.len(),
            rejected = report.rejected.len(),
            "credentials imported"
        );
        Ok(report)
    }

    /// Delete credentials, refusing those in use.
    pub async fn delete(&self, ids: &[u64]) -> Result<DeleteReport> {
        let (deleted, skipped) = self.store.delete_credentials(ids).await?;
        {
            let mut reserved = self.reserved.lock().await;
            for id in &deleted {
                reserved.remove(id);
            }
        }
        if !skipped.is_empty() {
            warn!(skipped = ?skipped, "refused to delete credentials in use");
        }
        info!(deleted = deleted.len(), "credentials deleted");
        Ok(DeleteReport { deleted, skipped })
    }

    /// Pool health summary for the admin API.
    ///
    /// No free credentials → unhealthy (new workers and failovers would
    /// fail), any banned or dead → degraded, otherwise healthy.
    pub async fn health(&self) -> serde_json::Value {
        let credentials = self.store.load_credentials().await;
        let reserved = self.reserved.lock().await.len();

        let count = |status: CredentialStatus| {
            credentials.iter().filter(|c| c.status == status).count()
        };
        let free = count(CredentialStatus::Free);
        let in_use = count(CredentialStatus::InUse);
        let banned = count(CredentialStatus::Banned);
        let dead = count(CredentialStatus::Dead);

        let status = if free == 0 {
            "unhealthy"
        } else if banned + dead > 0 {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": credentials.len(),
            "credentials_free": free,
            "credentials_in_use": in_use,
            "credentials_banned": banned,
            "credentials_dead": dead,
            "credentials_reserved": reserved,
        })
    }
}
