//! Credential failover
//!
//! Moves a worker whose credential was revoked onto a fresh one. Each run
//! probes every candidate at most once: rejected candidates become `Dead`,
//! candidates that fail transiently stay `Free` but are skipped for the rest
//! of the run. The loop therefore ends after at most one probe per
//! credential in the pool.
//!
//! A run that binds nothing stops the worker and clears its credential
//! binding. It is `Exhausted` only when no `Free` credential was left to
//! try; if some were skipped as unreachable the outcome is `Unreachable`
//! and the worker can simply be started again later.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_store::CredentialStatus;
use messenger::ClientError;
use serde::Serialize;
use tracing::{info, warn};

use crate::broadcast::{BroadcastNotifier, BroadcastReport};
use crate::error::Result;
use crate::lifecycle::WorkerEvent;
use crate::notify::AdminNotifier;
use crate::pool::{CredentialPool, fingerprint};
use crate::probe::ProbeClient;
use crate::registry::FleetRegistry;
use crate::worker::{self, WorkerContext};

const EXHAUSTED: &str = "pool exhausted";
const UNREACHABLE: &str = "no candidate credential reachable";

/// Stands in for the link in migration notices when the new identity has
/// no public username.
const MISSING_LINK_TEXT: &str = "(link unavailable)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailoverOutcome {
    /// The worker runs again on `credential_id`.
    Rebound {
        credential_id: u64,
        link: Option<String>,
        probes: usize,
        broadcast: BroadcastReport,
    },
    /// No `Free` credential was left; the worker is stopped.
    Exhausted { probes: usize },
    /// `skipped` free credentials failed transiently; the worker is stopped
    /// and may be started again once the platform answers.
    Unreachable { probes: usize, skipped: usize },
}

impl FailoverOutcome {
    fn label(&self) -> &'static str {
        match self {
            FailoverOutcome::Rebound { .. } => "rebound",
            FailoverOutcome::Exhausted { .. } => "exhausted",
            FailoverOutcome::Unreachable { .. } => "unreachable",
        }
    }
}

pub struct FailoverCoordinator {
    pool: Arc<CredentialPool>,
    probe: ProbeClient,
    registry: Arc<FleetRegistry>,
    notifier: Arc<dyn AdminNotifier>,
    broadcaster: Arc<BroadcastNotifier>,
    ctx: WorkerContext,
}

impl FailoverCoordinator {
    pub fn new(
        pool: Arc<CredentialPool>,
        probe: ProbeClient,
        registry: Arc<FleetRegistry>,
        notifier: Arc<dyn AdminNotifier>,
        broadcaster: Arc<BroadcastNotifier>,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            pool,
            probe,
            registry,
            notifier,
            broadcaster,
            ctx,
        }
    }

    /// Fail `worker_id` over to a fresh credential.
    ///
    /// `revoked` is marked `Banned` first; pass `None` when the worker has
    /// no usable credential to ban. Fails with `InvalidState` if a failover
    /// for this worker is already in progress.
    pub async fn run(&self, worker_id: u64, revoked: Option<u64>) -> Result<FailoverOutcome> {
        self.registry
            .advance(worker_id, WorkerEvent::CredentialRevoked)
            .await?;
        self.run_claimed(worker_id, revoked).await
    }

    /// Like `run`, for a worker the caller has already moved to `Failing`.
    pub async fn run_claimed(
        &self,
        worker_id: u64,
        revoked: Option<u64>,
    ) -> Result<FailoverOutcome> {
        match self.rebind(worker_id, revoked).await {
            Ok(outcome) => {
                metrics::counter!("fleet_failovers_total", "outcome" => outcome.label())
                    .increment(1);
                Ok(outcome)
            }
            Err(e) => {
                metrics::counter!("fleet_failovers_total", "outcome" => "error").increment(1);
                warn!(worker_id, error = %e, "failover aborted");
                let _ = self
                    .registry
                    .advance(worker_id, WorkerEvent::StartFailed)
                    .await;
                Err(e)
            }
        }
    }

    async fn rebind(&self, worker_id: u64, revoked: Option<u64>) -> Result<FailoverOutcome> {
        if let Some(handle) = self.registry.take_live(worker_id).await {
            handle.shutdown().await;
        }

        if let Some(credential_id) = revoked {
            self.pool.mark(credential_id, CredentialStatus::Banned).await?;
            warn!(worker_id, credential_id, "credential banned");
            self.notifier
                .notify(&format!(
                    "Worker #{worker_id}: credential #{credential_id} was revoked and is now banned. Looking for a replacement."
                ))
                .await;
        }

        let mut excluded = HashSet::new();
        let mut probes = 0usize;
        let mut skipped = 0usize;

        loop {
            let Some(candidate) = self.pool.reserve_free(&excluded).await else {
                return self.halt(worker_id, probes, skipped).await;
            };
            excluded.insert(candidate.id);
            probes += 1;

            let probed = match self.probe.probe(&candidate.secret).await {
                Ok(probed) => probed,
                Err(ClientError::Unauthorized(description)) => {
                    self.pool.mark(candidate.id, CredentialStatus::Dead).await?;
                    warn!(
                        worker_id,
                        credential_id = candidate.id,
                        fingerprint = %fingerprint(&candidate.secret),
                        %description,
                        "candidate rejected, marked dead"
                    );
                    self.notifier
                        .notify(&format!(
                            "Worker #{worker_id}: candidate credential #{} is dead.",
                            candidate.id
                        ))
                        .await;
                    continue;
                }
                Err(ClientError::Transient(description)) => {
                    self.pool.release(candidate.id).await;
                    skipped += 1;
                    warn!(
                        worker_id,
                        credential_id = candidate.id,
                        %description,
                        "candidate probe failed transiently, skipping"
                    );
                    continue;
                }
            };

            let link = probed.identity.link();
            self.pool
                .bind(
                    worker_id,
                    candidate.id,
                    probed.identity.username.clone(),
                    link.clone(),
                )
                .await?;
            self.registry
                .advance(worker_id, WorkerEvent::CandidateBound)
                .await?;
            self.registry
                .advance(worker_id, WorkerEvent::StartRequested)
                .await?;

            let live = worker::launch(
                &self.ctx,
                worker_id,
                candidate.id,
                probed.client,
                &probed.identity,
            )
            .await?;
            self.registry.insert_live(live).await;
            self.registry
                .advance(worker_id, WorkerEvent::IdentityConfirmed)
                .await?;

            info!(
                worker_id,
                credential_id = candidate.id,
                probes,
                "worker rebound to new credential"
            );
            let link_text = match &link {
                Some(link) => link.as_str(),
                None => {
                    warn!(worker_id, "new identity has no public link");
                    MISSING_LINK_TEXT
                }
            };
            self.notifier
                .notify(&format!(
                    "Worker #{worker_id} now runs on credential #{} ({link_text}).",
                    candidate.id
                ))
                .await;

            let broadcast = self.broadcaster.broadcast_migration(link_text).await;

            return Ok(FailoverOutcome::Rebound {
                credential_id: candidate.id,
                link,
                probes,
                broadcast,
            });
        }
    }

    /// Stop the worker after a run that bound nothing.
    async fn halt(&self, worker_id: u64, probes: usize, skipped: usize) -> Result<FailoverOutcome> {
        let (outcome, reason, event) = if skipped == 0 {
            (
                FailoverOutcome::Exhausted { probes },
                EXHAUSTED,
                WorkerEvent::PoolExhausted,
            )
        } else {
            (
                FailoverOutcome::Unreachable { probes, skipped },
                UNREACHABLE,
                WorkerEvent::CandidatesUnreachable,
            )
        };

        // The old credential is banned or was never usable
        self.ctx
            .store
            .update_worker_record(worker_id, |r| {
                r.is_running = false;
                r.credential_id = None;
                r.last_error = Some(reason.to_string());
            })
            .await?;
        self.registry.advance(worker_id, event).await?;

        warn!(worker_id, probes, skipped, reason, "failover found no usable credential");
        let notice = if skipped == 0 {
            format!(
                "Worker #{worker_id} is stopped: the credential pool is exhausted. Add credentials and restart it."
            )
        } else {
            format!(
                "Worker #{worker_id} is stopped: {skipped} free credential(s) could not be reached. Start it again once the platform responds."
            )
        };
        self.notifier.notify(&notice).await;
        Ok(outcome)
    }
}
