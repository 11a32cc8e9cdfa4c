//! Fleet facade
//!
//! Owns the pool, registry, failover coordinator, and broadcaster, and
//! exposes the operations the admin API drives. Revocations detected by
//! worker tasks arrive on an mpsc channel; `spawn_supervisor` drains it and
//! runs each failover on its own task, so different workers fail over
//! concurrently while the registry keeps any one worker to a single run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleet_store::{FleetStore, WorkerRecord};
use messenger::ClientFactory;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastNotifier, BroadcastReport, EditReport};
use crate::error::{Error, Result};
use crate::failover::{FailoverCoordinator, FailoverOutcome};
use crate::lifecycle::{WorkerEvent, WorkerState};
use crate::notify::AdminNotifier;
use crate::pool::{CredentialPool, DeleteReport, InsertReport};
use crate::probe::ProbeClient;
use crate::registry::FleetRegistry;
use crate::worker::{self, FleetEvent, Greeting, WorkerContext};

const EVENT_BUFFER: usize = 64;

/// Runtime knobs, filled from the service config.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub greeting: Greeting,
    /// Long-poll timeout passed to `get_updates`
    pub poll_timeout: Duration,
    /// Pause between sends of a general broadcast
    pub send_delay: Duration,
    /// Migration notice; `*link*` is replaced by the new bot link
    pub migration_template: String,
    /// Restart workers recorded as running when the process starts
    pub resume_on_start: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            greeting: Greeting::default(),
            poll_timeout: Duration::from_secs(30),
            send_delay: Duration::from_millis(20),
            migration_template: "We have moved! Continue here: *link*".into(),
            resume_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Running,
    AlreadyRunning,
    /// The bound credential was rejected, so the worker went through failover.
    FailedOver(FailoverOutcome),
}

/// A worker record joined with its in-memory state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub state: WorkerState,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub worker_id: u64,
    pub error: String,
}

/// Result of an operation applied to many workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<u64>,
    pub failed: Vec<BatchFailure>,
}

pub struct FleetManager {
    store: Arc<FleetStore>,
    pool: Arc<CredentialPool>,
    registry: Arc<FleetRegistry>,
    factory: Arc<dyn ClientFactory>,
    ctx: WorkerContext,
    failover: FailoverCoordinator,
    broadcaster: Arc<BroadcastNotifier>,
    resume_on_start: bool,
}

impl FleetManager {
    /// Build the manager. The returned receiver must be handed to
    /// `spawn_supervisor`, or revocations will never be acted on.
    pub fn new(
        store: Arc<FleetStore>,
        factory: Arc<dyn ClientFactory>,
        notifier: Arc<dyn AdminNotifier>,
        settings: FleetSettings,
    ) -> (Arc<Self>, mpsc::Receiver<FleetEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let greeting = Arc::new(RwLock::new(settings.greeting));
        let ctx = WorkerContext {
            store: store.clone(),
            greeting: greeting.clone(),
            events,
            poll_timeout: settings.poll_timeout,
        };
        let pool = Arc::new(CredentialPool::new(store.clone()));
        let registry = Arc::new(FleetRegistry::new());
        let broadcaster = Arc::new(BroadcastNotifier::new(
            store.clone(),
            registry.clone(),
            greeting,
            settings.migration_template,
            settings.send_delay,
        ));
        let failover = FailoverCoordinator::new(
            pool.clone(),
            ProbeClient::new(factory.clone()),
            registry.clone(),
            notifier,
            broadcaster.clone(),
            ctx.clone(),
        );

        let manager = Arc::new(Self {
            store,
            pool,
            registry,
            factory,
            ctx,
            failover,
            broadcaster,
            resume_on_start: settings.resume_on_start,
        });
        (manager, rx)
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    /// Drain revocation events, running each failover on its own task.
    pub fn spawn_supervisor(self: &Arc<Self>, mut events: mpsc::Receiver<FleetEvent>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.handle_event(event).await;
                });
            }
            debug!("supervisor channel closed");
        })
    }

    /// React to one worker event. Events that no longer match the live
    /// worker (it was stopped or already rebound) are ignored.
    pub async fn handle_event(&self, event: FleetEvent) {
        match event {
            FleetEvent::CredentialRevoked {
                worker_id,
                credential_id,
            } => {
                if let Err(e) = self
                    .registry
                    .advance_if_live(worker_id, credential_id, WorkerEvent::CredentialRevoked)
                    .await
                {
                    debug!(worker_id, credential_id, error = %e, "ignoring stale revocation");
                    return;
                }
                match self.failover.run_claimed(worker_id, Some(credential_id)).await {
                    Ok(outcome) => info!(worker_id, ?outcome, "failover finished"),
                    Err(e) => warn!(worker_id, error = %e, "failover failed"),
                }
            }
        }
    }

    // --- Workers ---

    /// Create a worker on the lowest-id free credential and start it.
    ///
    /// Fails with `PoolExhausted` (and creates nothing) if no credential is
    /// free. A transient start failure still returns the new id; the record
    /// carries the error.
    pub async fn create_worker(&self) -> Result<u64> {
        let candidate = self
            .pool
            .reserve_free(&Default::default())
            .await
            .ok_or(Error::PoolExhausted)?;
        let record = self.pool.assign(candidate.id).await?;
        info!(worker_id = record.id, credential_id = candidate.id, "worker created");

        match self.start_worker(record.id).await {
            Ok(outcome) => debug!(worker_id = record.id, ?outcome, "new worker started"),
            Err(Error::Transient(e)) => {
                warn!(worker_id = record.id, error = %e, "new worker could not start");
            }
            Err(e) => return Err(e),
        }
        Ok(record.id)
    }

    /// Start a stopped worker. A rejected credential hands the worker to
    /// failover; a transient failure leaves it stopped with `last_error`.
    pub async fn start_worker(&self, id: u64) -> Result<StartOutcome> {
        let record = self
            .store
            .load_worker_record(id)
            .await
            .ok_or(Error::WorkerNotFound(id))?;
        if self.registry.state(id).await == WorkerState::Running {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let credential = match record.credential_id {
            Some(credential_id) => self.store.credential(credential_id).await,
            None => None,
        };
        let Some(credential) = credential.filter(|c| !c.status.is_terminal()) else {
            info!(worker_id = id, "worker has no usable credential, failing over");
            let outcome = self.failover.run(id, None).await?;
            return Ok(StartOutcome::FailedOver(outcome));
        };

        self.registry
            .advance(id, WorkerEvent::StartRequested)
            .await?;
        let client = self.factory.connect(&credential.secret);
        match worker::start(&self.ctx, id, credential.id, client).await {
            Ok(live) => {
                self.registry.insert_live(live).await;
                self.registry
                    .advance(id, WorkerEvent::IdentityConfirmed)
                    .await?;
                Ok(StartOutcome::Running)
            }
            Err(Error::CredentialInvalid(description)) => {
                warn!(worker_id = id, credential_id = credential.id, %description, "credential rejected at start");
                self.registry
                    .advance(id, WorkerEvent::CredentialRevoked)
                    .await?;
                let outcome = self.failover.run_claimed(id, Some(credential.id)).await?;
                Ok(StartOutcome::FailedOver(outcome))
            }
            Err(e) => {
                self.registry.advance(id, WorkerEvent::StartFailed).await?;
                Err(e)
            }
        }
    }

    /// Stop a worker and wait for its task to finish. Stopping a stopped
    /// worker changes nothing.
    pub async fn stop_worker(&self, id: u64) -> Result<()> {
        if self.store.load_worker_record(id).await.is_none() {
            return Err(Error::WorkerNotFound(id));
        }
        self.registry
            .advance(id, WorkerEvent::StopRequested)
            .await?;
        if let Some(handle) = self.registry.take_live(id).await {
            handle.shutdown().await;
        }
        self.store
            .update_worker_record(id, |r| r.is_running = false)
            .await?;
        Ok(())
    }

    /// Stop, release the credential back to the pool, and delete the record.
    pub async fn delete_worker(&self, id: u64) -> Result<()> {
        self.stop_worker(id).await?;
        self.store.delete_worker(id).await?;
        self.registry.forget(id).await;
        info!(worker_id = id, "worker deleted");
        Ok(())
    }

    pub async fn list_workers(&self) -> Vec<WorkerView> {
        let mut views = Vec::new();
        for record in self.store.list_workers().await {
            let state = self.registry.state(record.id).await;
            let live = self.registry.is_live(record.id).await;
            views.push(WorkerView {
                record,
                state,
                live,
            });
        }
        views
    }

    pub async fn worker(&self, id: u64) -> Result<WorkerView> {
        let record = self
            .store
            .load_worker_record(id)
            .await
            .ok_or(Error::WorkerNotFound(id))?;
        Ok(WorkerView {
            state: self.registry.state(id).await,
            live: self.registry.is_live(id).await,
            record,
        })
    }

    /// Operator-initiated failover. The worker's current credential, if it
    /// is still usable, is treated as revoked.
    pub async fn trigger_failover(&self, id: u64) -> Result<FailoverOutcome> {
        let record = self
            .store
            .load_worker_record(id)
            .await
            .ok_or(Error::WorkerNotFound(id))?;
        let revoked = match record.credential_id {
            Some(credential_id) => self
                .store
                .credential(credential_id)
                .await
                .filter(|c| !c.status.is_terminal())
                .map(|c| c.id),
            None => None,
        };
        self.failover.run(id, revoked).await
    }

    /// Start every stopped worker.
    pub async fn start_all(&self) -> BatchReport {
        let mut ids = Vec::new();
        for record in self.store.list_workers().await {
            if self.registry.state(record.id).await == WorkerState::Stopped {
                ids.push(record.id);
            }
        }
        self.start_each(ids).await
    }

    /// Stop every live worker.
    pub async fn stop_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for (id, _) in self.registry.live_clients().await {
            match self.stop_worker(id).await {
                Ok(()) => report.succeeded.push(id),
                Err(e) => report.failed.push(BatchFailure {
                    worker_id: id,
                    error: e.to_string(),
                }),
            }
        }
        info!(
            stopped = report.succeeded.len(),
            failed = report.failed.len(),
            "stop all finished"
        );
        report
    }

    /// Restart workers that were running when the process last exited.
    pub async fn reconcile(&self) -> BatchReport {
        if !self.resume_on_start {
            info!("resume on start disabled, leaving workers stopped");
            return BatchReport::default();
        }
        let ids: Vec<u64> = self
            .store
            .list_workers()
            .await
            .into_iter()
            .filter(|r| r.is_running)
            .map(|r| r.id)
            .collect();
        info!(workers = ids.len(), "resuming workers");
        self.start_each(ids).await
    }

    async fn start_each(&self, ids: Vec<u64>) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            let result = self.start_worker(id).await;
            match result {
                Ok(StartOutcome::FailedOver(FailoverOutcome::Exhausted { .. })) => {
                    report.failed.push(BatchFailure {
                        worker_id: id,
                        error: Error::PoolExhausted.to_string(),
                    });
                }
                Ok(StartOutcome::FailedOver(FailoverOutcome::Unreachable { skipped, .. })) => {
                    report.failed.push(BatchFailure {
                        worker_id: id,
                        error: format!("no candidate credential reachable ({skipped} skipped)"),
                    });
                }
                Ok(_) => report.succeeded.push(id),
                Err(e) => {
                    warn!(worker_id = id, error = %e, "worker failed to start");
                    report.failed.push(BatchFailure {
                        worker_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Stop every live worker without recording it as stopped, so the next
    /// process start resumes it.
    pub async fn shutdown(&self) {
        let handles = self.registry.drain().await;
        info!(workers = handles.len(), "stopping workers for shutdown");
        for handle in handles {
            handle.shutdown().await;
        }
    }

    // --- Credentials ---

    pub async fn add_credentials<S: AsRef<str>>(&self, secrets: &[S]) -> Result<InsertReport> {
        self.pool.bulk_insert(secrets).await
    }

    pub async fn delete_credentials(&self, ids: &[u64]) -> Result<DeleteReport> {
        self.pool.delete(ids).await
    }

    // --- Broadcasts ---

    pub async fn broadcast(&self, text: &str, photo: Option<&Path>) -> Result<BroadcastReport> {
        self.broadcaster.broadcast_general(text, photo).await
    }

    pub async fn edit_greetings(&self, text: &str) -> EditReport {
        self.broadcaster.edit_greetings(text).await
    }
}
