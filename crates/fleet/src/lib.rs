//! Bot fleet supervision and credential rotation
//!
//! Every worker bot runs on exactly one credential drawn from a shared pool.
//! When the platform revokes a worker's credential, the worker's dispatch
//! loop reports it to the manager's supervisor task, which hands the worker
//! to the failover coordinator:
//!
//! 1. Revoked credential → `Banned`
//! 2. Reserve the lowest-id `Free` candidate and probe it
//! 3. Probe rejected → candidate `Dead`, next candidate
//! 4. Probe accepted → bind, restart the worker, broadcast the new link to
//!    the users of every live worker
//! 5. No candidates left → worker `Stopped` with `last_error = "pool exhausted"`,
//!    or `"no candidate credential reachable"` when free candidates were
//!    skipped after transient probe failures
//!
//! Transient platform errors never change credential state.

pub mod broadcast;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod lifecycle;
pub mod manager;
pub mod notify;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::{BroadcastNotifier, BroadcastReport, EditReport, render_link_placeholder};
pub use error::{Error, Result};
pub use failover::{FailoverCoordinator, FailoverOutcome};
pub use lifecycle::{WorkerEvent, WorkerState, transition};
pub use manager::{BatchFailure, BatchReport, FleetManager, FleetSettings, StartOutcome, WorkerView};
pub use notify::{AdminNotifier, LogNotifier, MessengerAdminNotifier};
pub use pool::{CredentialPool, DeleteReport, InsertReport, RejectReason, Rejected, fingerprint};
pub use probe::{ProbeClient, Probed};
pub use registry::FleetRegistry;
pub use worker::{FleetEvent, Greeting, LiveWorker, WorkerContext};
