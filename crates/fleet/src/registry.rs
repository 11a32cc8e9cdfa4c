//! In-memory registry of live workers and their lifecycle states
//!
//! Not persisted; rebuilt by reconciliation on start-up. Handles and states
//! sit behind one lock so "is it running" and "may it transition" are always
//! answered from the same snapshot. Handles are handed out by value and torn
//! down by the caller after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use messenger::MessengerClient;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lifecycle::{WorkerEvent, WorkerState, transition};
use crate::worker::LiveWorker;

#[derive(Default)]
struct Inner {
    live: HashMap<u64, LiveWorker>,
    states: HashMap<u64, WorkerState>,
}

impl Inner {
    fn state(&self, id: u64) -> WorkerState {
        self.states.get(&id).copied().unwrap_or(WorkerState::Stopped)
    }

    fn apply(&mut self, id: u64, event: WorkerEvent) -> Result<WorkerState> {
        let current = self.state(id);
        let next = transition(current, event).ok_or(Error::InvalidState {
            id,
            state: current.label(),
        })?;
        self.states.insert(id, next);
        debug!(
            worker_id = id,
            from = current.label(),
            to = next.label(),
            ?event,
            "worker state transition"
        );
        Ok(next)
    }

    fn publish_gauge(&self) {
        metrics::gauge!("fleet_workers_live").set(self.live.len() as f64);
    }
}

#[derive(Default)]
pub struct FleetRegistry {
    inner: Mutex<Inner>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; unknown workers are `Stopped`.
    pub async fn state(&self, id: u64) -> WorkerState {
        self.inner.lock().await.state(id)
    }

    /// Apply a lifecycle event atomically.
    pub async fn advance(&self, id: u64, event: WorkerEvent) -> Result<WorkerState> {
        self.inner.lock().await.apply(id, event)
    }

    /// Apply `event` only if the worker is `Running` on `credential_id`.
    ///
    /// Events raised by a worker that has since been stopped or rebound are
    /// refused with `InvalidState` and change nothing.
    pub async fn advance_if_live(
        &self,
        id: u64,
        credential_id: u64,
        event: WorkerEvent,
    ) -> Result<WorkerState> {
        let mut inner = self.inner.lock().await;
        let current = inner.state(id);
        let live_credential = inner.live.get(&id).map(|h| h.credential_id);
        if current != WorkerState::Running || live_credential != Some(credential_id) {
            return Err(Error::InvalidState {
                id,
                state: current.label(),
            });
        }
        inner.apply(id, event)
    }

    pub async fn insert_live(&self, handle: LiveWorker) {
        let mut inner = self.inner.lock().await;
        inner.live.insert(handle.id, handle);
        inner.publish_gauge();
    }

    pub async fn take_live(&self, id: u64) -> Option<LiveWorker> {
        let mut inner = self.inner.lock().await;
        let handle = inner.live.remove(&id);
        inner.publish_gauge();
        handle
    }

    pub async fn is_live(&self, id: u64) -> bool {
        self.inner.lock().await.live.contains_key(&id)
    }

    /// Clients of every live worker, ordered by worker id.
    pub async fn live_clients(&self) -> Vec<(u64, Arc<dyn MessengerClient>)> {
        let inner = self.inner.lock().await;
        let mut clients: Vec<_> = inner
            .live
            .values()
            .map(|h| (h.id, h.client()))
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        clients
    }

    /// Drop all trace of a deleted worker. Its handle must already be gone.
    pub async fn forget(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.states.remove(&id);
        if inner.live.remove(&id).is_some() {
            debug!(worker_id = id, "dropped live handle of forgotten worker");
        }
        inner.publish_gauge();
    }

    /// Take every live handle and mark the workers stopped. Used at shutdown.
    pub async fn drain(&self) -> Vec<LiveWorker> {
        let mut inner = self.inner.lock().await;
        let handles: Vec<LiveWorker> = inner.live.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            inner.states.insert(handle.id, WorkerState::Stopped);
        }
        inner.publish_gauge();
        handles
    }
}
