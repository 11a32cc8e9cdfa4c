//! Worker start-up and the live handle
//!
//! A worker is a persisted record plus, while it executes, a `LiveWorker`:
//! the client bound to its credential and the dispatch task driving it.
//! Dropping into `Running` always goes through `launch`, which persists the
//! resolved identity before the task is spawned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_store::FleetStore;
use messenger::{Identity, MessengerClient};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch;
use crate::error::Result;

/// Signals from worker tasks to the manager's supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// The platform rejected `credential_id` while `worker_id` was polling.
    CredentialRevoked { worker_id: u64, credential_id: u64 },
}

/// Reply sent on `/start`.
#[derive(Debug, Clone, Default)]
pub struct Greeting {
    pub text: String,
    /// Sent with `text` as caption when the file is readable
    pub photo: Option<PathBuf>,
}

/// Shared dependencies of every worker task.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<FleetStore>,
    pub greeting: Arc<RwLock<Greeting>>,
    pub events: mpsc::Sender<FleetEvent>,
    pub poll_timeout: Duration,
}

/// Handle to an executing worker. Exists exactly as long as the worker runs.
pub struct LiveWorker {
    pub id: u64,
    pub credential_id: u64,
    client: Arc<dyn MessengerClient>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LiveWorker {
    pub fn client(&self) -> Arc<dyn MessengerClient> {
        self.client.clone()
    }

    /// Signal the dispatch loop and wait for it to unwind.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(worker_id = self.id, error = %e, "dispatch task ended abnormally");
        }
        info!(worker_id = self.id, "worker stopped");
    }
}

/// Confirm the credential with an identity call, then launch.
///
/// On failure the record gets `last_error` and `is_running = false`. A
/// rejected credential surfaces as `Error::CredentialInvalid`.
pub async fn start(
    ctx: &WorkerContext,
    worker_id: u64,
    credential_id: u64,
    client: Arc<dyn MessengerClient>,
) -> Result<LiveWorker> {
    match client.get_self_identity().await {
        Ok(identity) => launch(ctx, worker_id, credential_id, client, &identity).await,
        Err(e) => {
            warn!(worker_id, credential_id, error = %e, "identity check failed");
            let message = e.to_string();
            ctx.store
                .update_worker_record(worker_id, |r| {
                    r.is_running = false;
                    r.last_error = Some(message);
                })
                .await?;
            Err(e.into())
        }
    }
}

/// Persist the identity and spawn the dispatch loop. Used directly after a
/// probe has already confirmed the credential.
pub async fn launch(
    ctx: &WorkerContext,
    worker_id: u64,
    credential_id: u64,
    client: Arc<dyn MessengerClient>,
    identity: &Identity,
) -> Result<LiveWorker> {
    let display_identity = identity.username.clone();
    let link = identity.link();
    ctx.store
        .update_worker_record(worker_id, |r| {
            r.display_identity = display_identity;
            r.link = link;
            r.is_running = true;
            r.last_error = None;
        })
        .await?;

    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(dispatch::run(
        ctx.clone(),
        worker_id,
        credential_id,
        client.clone(),
        rx,
    ));

    info!(
        worker_id,
        credential_id,
        username = identity.username.as_deref().unwrap_or(""),
        "worker running"
    );

    Ok(LiveWorker {
        id: worker_id,
        credential_id,
        client,
        shutdown: Some(tx),
        task,
    })
}
